//! Database repository implementations

pub mod envelope_repository;
pub mod room_repository;

pub use envelope_repository::{EnvelopeRepository, StoredEnvelope};
pub use room_repository::RoomRepository;
