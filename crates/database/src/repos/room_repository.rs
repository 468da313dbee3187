//! Room membership, administered from the CLI and read by the relay.

use async_trait::async_trait;
use chrono::Utc;
use parley_protocol::{RoomId, UserId};
use parley_relay::{CollaboratorError, MembershipDirectory, Room};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::info;

use crate::error::{DatabaseError, DatabaseResult};

#[derive(Clone)]
pub struct RoomRepository {
    pool: SqlitePool,
}

impl RoomRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the room if it does not exist. Returns `true` when it was created.
    pub async fn create(&self, room: &RoomId, key_id: Option<&str>) -> DatabaseResult<bool> {
        validate_id("room", room.as_str())?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO rooms (id, key_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(room.as_str())
        .bind(key_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        if created {
            info!(room = %room, "room created");
        }
        Ok(created)
    }

    /// Add a member, creating the room on first use. Returns `false` if already a member.
    pub async fn add_member(&self, room: &RoomId, user: &UserId) -> DatabaseResult<bool> {
        validate_id("user", user.as_str())?;
        self.create(room, None).await?;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO room_members (room_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(room.as_str())
        .bind(user.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        let added = result.rows_affected() == 1;
        if added {
            info!(room = %room, user_id = %user, "member added");
        }
        Ok(added)
    }

    pub async fn remove_member(&self, room: &RoomId, user: &UserId) -> DatabaseResult<bool> {
        let result = sqlx::query("DELETE FROM room_members WHERE room_id = ? AND user_id = ?")
            .bind(room.as_str())
            .bind(user.as_str())
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected() == 1;
        if removed {
            info!(room = %room, user_id = %user, "member removed");
        }
        Ok(removed)
    }

    pub async fn find(&self, room: &RoomId) -> DatabaseResult<Option<Room>> {
        let row = sqlx::query("SELECT id, key_id FROM rooms WHERE id = ?")
            .bind(room.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let key_id: Option<String> = row.try_get("key_id")?;
        let members = self.members(room).await?;
        Ok(Some(Room {
            id: room.clone(),
            members,
            key_id,
        }))
    }

    pub async fn members(&self, room: &RoomId) -> DatabaseResult<HashSet<UserId>> {
        let members: Vec<String> =
            sqlx::query_scalar("SELECT user_id FROM room_members WHERE room_id = ?")
                .bind(room.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(members.into_iter().map(UserId::new).collect())
    }

    pub async fn rooms_for(&self, user: &UserId) -> DatabaseResult<Vec<RoomId>> {
        let rooms: Vec<String> = sqlx::query_scalar(
            "SELECT room_id FROM room_members WHERE user_id = ? ORDER BY room_id ASC",
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rooms.into_iter().map(RoomId::new).collect())
    }
}

fn validate_id(kind: &str, value: &str) -> DatabaseResult<()> {
    if value.trim().is_empty() {
        return Err(DatabaseError::ValidationError(format!(
            "{kind} id must not be empty"
        )));
    }
    Ok(())
}

#[async_trait]
impl MembershipDirectory for RoomRepository {
    async fn members_of(&self, room: &RoomId) -> Result<HashSet<UserId>, CollaboratorError> {
        Ok(self.members(room).await?)
    }
}
