//! Peripheral entities: goals, rooms, participants, relationships
//!
//! Plain CRUD with the same tenant scoping rules as the memory and knowledge
//! stores.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::registry::TenantRegistry;
use crate::Result;

/// Goal lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    InProgress,
    Done,
    Failed,
}

impl GoalStatus {
    const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    fn from_str_value(s: &str) -> Self {
        match s {
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::InProgress,
        }
    }
}

/// An agent goal with free-form objectives
#[derive(Debug, Clone)]
pub struct Goal {
    pub id: String,
    pub owner_id: Option<String>,
    pub room_id: Option<String>,
    pub agent_id: String,
    pub name: String,
    pub status: GoalStatus,
    pub objectives: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Goal {
    /// Create a new in-progress goal
    #[must_use]
    pub fn new(name: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: format!("goal_{}", Uuid::new_v4()),
            owner_id: None,
            room_id: None,
            agent_id: agent_id.into(),
            name: name.into(),
            status: GoalStatus::InProgress,
            objectives: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Set the owner
    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Set the room
    #[must_use]
    pub fn in_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Add an objective
    #[must_use]
    pub fn with_objective(mut self, objective: impl Into<String>) -> Self {
        self.objectives.push(objective.into());
        self
    }
}

/// A conversation room
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// Room membership
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub user_id: String,
    pub room_id: String,
}

/// A bidirectional relation between two users
#[derive(Debug, Clone)]
pub struct Relationship {
    pub id: String,
    pub user_a: String,
    pub user_b: String,
    pub status: String,
}

/// Store for goals, rooms, participants, and relationships
#[derive(Clone)]
pub struct WorldStore {
    registry: Arc<TenantRegistry>,
}

impl WorldStore {
    /// Create a new world store over a registry
    #[must_use]
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self { registry }
    }

    /// Store a goal
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn create_goal(&self, goal: &Goal, tenant: Option<&str>) -> Result<()> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let objectives = serde_json::to_string(&goal.objectives)?;

        conn.execute(
            r"INSERT INTO goals (id, owner_id, room_id, agent_id, name, status, objectives, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                goal.id,
                goal.owner_id,
                goal.room_id,
                goal.agent_id,
                goal.name,
                goal.status.as_str(),
                objectives,
                goal.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// List goals, optionally scoped to a room
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn goals(&self, room_id: Option<&str>, tenant: Option<&str>) -> Result<Vec<Goal>> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let mut stmt = conn.prepare(
            r"SELECT id, owner_id, room_id, agent_id, name, status, objectives, created_at
              FROM goals
              WHERE ?1 IS NULL OR room_id = ?1
              ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([room_id], row_to_goal)?;
        Ok(rows.flatten().collect())
    }

    /// Update a goal's status
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn update_goal_status(
        &self,
        id: &str,
        status: GoalStatus,
        tenant: Option<&str>,
    ) -> Result<bool> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let updated = conn.execute(
            "UPDATE goals SET status = ?1 WHERE id = ?2",
            [status.as_str(), id],
        )?;
        Ok(updated > 0)
    }

    /// Delete a goal
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn remove_goal(&self, id: &str, tenant: Option<&str>) -> Result<bool> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let deleted = conn.execute("DELETE FROM goals WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    /// Delete every goal in a room
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn remove_all_goals(&self, room_id: &str, tenant: Option<&str>) -> Result<usize> {
        let conn = self.registry.handle(tenant)?.conn()?;
        Ok(conn.execute("DELETE FROM goals WHERE room_id = ?1", [room_id])?)
    }

    /// Create a room, generating an id when none is supplied
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn create_room(&self, id: Option<&str>, tenant: Option<&str>) -> Result<String> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let room_id = id.map_or_else(|| format!("room_{}", Uuid::new_v4()), str::to_string);

        conn.execute(
            "INSERT OR IGNORE INTO rooms (id) VALUES (?1)",
            [&room_id],
        )?;
        Ok(room_id)
    }

    /// Get a room by id
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn get_room(&self, id: &str, tenant: Option<&str>) -> Result<Option<Room>> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let result = conn.query_row(
            "SELECT id, created_at FROM rooms WHERE id = ?1",
            [id],
            |row| {
                let created_at: String = row.get(1)?;
                Ok(Room {
                    id: row.get(0)?,
                    created_at: parse_timestamp(&created_at),
                })
            },
        );

        match result {
            Ok(room) => Ok(Some(room)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a room and its membership rows
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn remove_room(&self, id: &str, tenant: Option<&str>) -> Result<bool> {
        let conn = self.registry.handle(tenant)?.conn()?;
        conn.execute("DELETE FROM participants WHERE room_id = ?1", [id])?;
        let deleted = conn.execute("DELETE FROM rooms WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    /// Add a user to a room (idempotent)
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn add_participant(
        &self,
        user_id: &str,
        room_id: &str,
        tenant: Option<&str>,
    ) -> Result<()> {
        let conn = self.registry.handle(tenant)?.conn()?;
        conn.execute(
            r"INSERT OR IGNORE INTO participants (id, user_id, room_id)
              VALUES (?1, ?2, ?3)",
            rusqlite::params![format!("part_{}", Uuid::new_v4()), user_id, room_id],
        )?;
        Ok(())
    }

    /// List a room's participants
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn participants_for_room(
        &self,
        room_id: &str,
        tenant: Option<&str>,
    ) -> Result<Vec<Participant>> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, user_id, room_id FROM participants WHERE room_id = ?1",
        )?;
        let rows = stmt.query_map([room_id], |row| {
            Ok(Participant {
                id: row.get(0)?,
                user_id: row.get(1)?,
                room_id: row.get(2)?,
            })
        })?;
        Ok(rows.flatten().collect())
    }

    /// Remove a user from a room
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn remove_participant(
        &self,
        user_id: &str,
        room_id: &str,
        tenant: Option<&str>,
    ) -> Result<bool> {
        let conn = self.registry.handle(tenant)?.conn()?;
        let deleted = conn.execute(
            "DELETE FROM participants WHERE user_id = ?1 AND room_id = ?2",
            [user_id, room_id],
        )?;
        Ok(deleted > 0)
    }

    /// Create a relationship between two users
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the write fails.
    pub fn create_relationship(
        &self,
        user_a: &str,
        user_b: &str,
        tenant: Option<&str>,
    ) -> Result<()> {
        let conn = self.registry.handle(tenant)?.conn()?;
        conn.execute(
            r"INSERT INTO relationships (id, user_a, user_b) VALUES (?1, ?2, ?3)",
            rusqlite::params![format!("rel_{}", Uuid::new_v4()), user_a, user_b],
        )?;
        Ok(())
    }

    /// Look up the relationship between two users, in either direction
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn get_relationship(
        &self,
        user_a: &str,
        user_b: &str,
        tenant: Option<&str>,
    ) -> Result<Option<Relationship>> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let result = conn.query_row(
            r"SELECT id, user_a, user_b, status FROM relationships
              WHERE (user_a = ?1 AND user_b = ?2) OR (user_a = ?2 AND user_b = ?1)",
            [user_a, user_b],
            row_to_relationship,
        );

        match result {
            Ok(rel) => Ok(Some(rel)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List every relationship involving a user
    ///
    /// # Errors
    ///
    /// Returns error if the partition cannot be resolved or the read fails.
    pub fn relationships(&self, user_id: &str, tenant: Option<&str>) -> Result<Vec<Relationship>> {
        let conn = self.registry.handle(tenant)?.conn()?;

        let mut stmt = conn.prepare(
            r"SELECT id, user_a, user_b, status FROM relationships
              WHERE user_a = ?1 OR user_b = ?1",
        )?;
        let rows = stmt.query_map([user_id], row_to_relationship)?;
        Ok(rows.flatten().collect())
    }
}

impl std::fmt::Debug for WorldStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldStore").finish_non_exhaustive()
    }
}

fn row_to_goal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Goal> {
    let status: String = row.get(5)?;
    let objectives: String = row.get(6)?;
    let created_at: String = row.get(7)?;

    Ok(Goal {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        room_id: row.get(2)?,
        agent_id: row.get(3)?,
        name: row.get(4)?,
        status: GoalStatus::from_str_value(&status),
        objectives: serde_json::from_str(&objectives).unwrap_or_default(),
        created_at: parse_timestamp(&created_at),
    })
}

fn row_to_relationship(row: &rusqlite::Row<'_>) -> rusqlite::Result<Relationship> {
    Ok(Relationship {
        id: row.get(0)?,
        user_a: row.get(1)?,
        user_b: row.get(2)?,
        status: row.get(3)?,
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> WorldStore {
        let registry = Arc::new(TenantRegistry::open_in_memory().unwrap());
        WorldStore::new(registry)
    }

    #[test]
    fn test_goal_lifecycle() {
        let store = setup();

        let goal = Goal::new("learn rust", "agent-1")
            .with_owner("u1")
            .in_room("r1")
            .with_objective("read the book");
        store.create_goal(&goal, None).unwrap();

        let goals = store.goals(Some("r1"), None).unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].status, GoalStatus::InProgress);
        assert_eq!(goals[0].objectives, vec!["read the book"]);
        assert_eq!(goals[0].agent_id, "agent-1");

        assert!(store.update_goal_status(&goal.id, GoalStatus::Done, None).unwrap());
        assert_eq!(store.goals(None, None).unwrap()[0].status, GoalStatus::Done);

        assert!(store.remove_goal(&goal.id, None).unwrap());
        assert!(store.goals(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_room_membership() {
        let store = setup();

        let room = store.create_room(None, None).unwrap();
        assert!(store.get_room(&room, None).unwrap().is_some());

        store.add_participant("u1", &room, None).unwrap();
        store.add_participant("u2", &room, None).unwrap();
        // Idempotent add
        store.add_participant("u1", &room, None).unwrap();

        assert_eq!(store.participants_for_room(&room, None).unwrap().len(), 2);
        assert!(store.remove_participant("u1", &room, None).unwrap());
        assert_eq!(store.participants_for_room(&room, None).unwrap().len(), 1);

        assert!(store.remove_room(&room, None).unwrap());
        assert!(store.get_room(&room, None).unwrap().is_none());
        assert!(store.participants_for_room(&room, None).unwrap().is_empty());
    }

    #[test]
    fn test_relationship_bidirectional() {
        let store = setup();

        store.create_relationship("alice", "bob", None).unwrap();

        // Either direction resolves the same row
        assert!(store.get_relationship("alice", "bob", None).unwrap().is_some());
        assert!(store.get_relationship("bob", "alice", None).unwrap().is_some());
        assert!(store.get_relationship("alice", "carol", None).unwrap().is_none());

        assert_eq!(store.relationships("bob", None).unwrap().len(), 1);
    }
}
