//! Role-based access checks.
//!
//! Every user has an authority level. Operations need a minimum level, and a
//! few also pass for the record's creator at a lower level.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

use crate::engine::EngineError;
use crate::model::{Actor, Reservation, Room, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Student,
    Doorkeeper,
    ClassRep,
    Assistant,
    Professor,
    Admin,
}

impl Role {
    pub fn level(self) -> u8 {
        match self {
            Role::Student => 10,
            Role::Doorkeeper => 20,
            Role::ClassRep => 30,
            Role::Assistant => 50,
            Role::Professor => 70,
            Role::Admin => 100,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Doorkeeper => "doorkeeper",
            Role::ClassRep => "class_rep",
            Role::Assistant => "assistant",
            Role::Professor => "professor",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoleParseError {
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("malformed role entry {0:?}, expected <user id>=<role>")]
    MalformedEntry(String),
}

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(Role::Student),
            "doorkeeper" => Ok(Role::Doorkeeper),
            "class_rep" => Ok(Role::ClassRep),
            "assistant" => Ok(Role::Assistant),
            "professor" => Ok(Role::Professor),
            "admin" => Ok(Role::Admin),
            other => Err(RoleParseError::UnknownRole(other.to_string())),
        }
    }
}

/// Resolves how much an actor is trusted.
pub trait Authority: Send + Sync {
    fn authority_of(&self, actor: &Actor) -> u8;
}

/// Fixed user → role table. Users not listed are students.
#[derive(Debug, Clone, Default)]
pub struct StaticRoles {
    roles: HashMap<UserId, Role>,
}

impl StaticRoles {
    /// Parse `"1=admin,7=assistant"`. Blank input is an empty table.
    pub fn parse(table: &str) -> Result<Self, RoleParseError> {
        let mut roles = HashMap::new();
        for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (user, role) = entry
                .split_once('=')
                .ok_or_else(|| RoleParseError::MalformedEntry(entry.to_string()))?;
            let user: UserId = user
                .trim()
                .parse()
                .map_err(|_| RoleParseError::MalformedEntry(entry.to_string()))?;
            roles.insert(user, role.parse()?);
        }
        Ok(Self { roles })
    }

    pub fn with(mut self, user: UserId, role: Role) -> Self {
        self.roles.insert(user, role);
        self
    }

    pub fn role_of(&self, user: UserId) -> Role {
        self.roles.get(&user).copied().unwrap_or(Role::Student)
    }
}

impl Authority for StaticRoles {
    fn authority_of(&self, actor: &Actor) -> u8 {
        self.role_of(actor.id).level()
    }
}

/// The minimum authority each operation requires.
#[derive(Clone)]
pub struct AccessPolicy {
    authority: Arc<dyn Authority>,
}

impl AccessPolicy {
    pub fn new(authority: Arc<dyn Authority>) -> Self {
        Self { authority }
    }

    fn require(&self, actor: &Actor, role: Role, action: &str) -> Result<(), EngineError> {
        if self.authority.authority_of(actor) >= role.level() {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "user {} may not {action} (requires {role})",
                actor.id
            )))
        }
    }

    fn require_or_owner(
        &self,
        actor: &Actor,
        role: Role,
        owner: UserId,
        owner_role: Role,
        action: &str,
    ) -> Result<(), EngineError> {
        let level = self.authority.authority_of(actor);
        if level >= role.level() || (actor.id == owner && level >= owner_role.level()) {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "user {} may not {action} (requires {role} or ownership)",
                actor.id
            )))
        }
    }

    pub fn can_read(&self, actor: &Actor) -> Result<(), EngineError> {
        self.require(actor, Role::Student, "read")
    }

    pub fn can_create_reservation(&self, actor: &Actor) -> Result<(), EngineError> {
        self.require(actor, Role::Student, "create reservations")
    }

    /// Update and cancel share the same rule.
    pub fn can_modify_reservation(
        &self,
        actor: &Actor,
        reservation: &Reservation,
    ) -> Result<(), EngineError> {
        self.require_or_owner(
            actor,
            Role::Assistant,
            reservation.created_by,
            Role::Student,
            "modify this reservation",
        )
    }

    pub fn can_edit_calendar(&self, actor: &Actor) -> Result<(), EngineError> {
        self.require(actor, Role::Assistant, "edit rooms or calendars")
    }

    pub fn can_delete_calendar_entry(&self, actor: &Actor) -> Result<(), EngineError> {
        self.require(actor, Role::Admin, "delete calendar entries")
    }

    pub fn can_delete_room(&self, actor: &Actor, room: &Room) -> Result<(), EngineError> {
        self.require_or_owner(
            actor,
            Role::Admin,
            room.created_by,
            Role::Assistant,
            "delete this room",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ErrorKind;
    use chrono::{FixedOffset, TimeZone, Utc};
    use ulid::Ulid;

    fn policy() -> AccessPolicy {
        let roles = StaticRoles::parse("1=admin, 2=assistant, 3=class_rep").unwrap();
        AccessPolicy::new(Arc::new(roles))
    }

    fn reservation_by(user: UserId) -> Reservation {
        let tz = FixedOffset::east_opt(0).unwrap();
        let now = Utc::now();
        Reservation {
            id: Ulid::new(),
            code: "C".into(),
            room_id: Ulid::new(),
            group_id: 1,
            link_id: None,
            start: tz.with_ymd_and_hms(2025, 10, 27, 10, 0, 0).unwrap(),
            end: tz.with_ymd_and_hms(2025, 10, 27, 11, 0, 0).unwrap(),
            purpose: "p".into(),
            priority: 0,
            created_by: user,
            updated_by: None,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
            cancelled_by: None,
            preempted_by: None,
        }
    }

    fn room_by(user: UserId) -> Room {
        let now = Utc::now();
        Room {
            id: Ulid::new(),
            name: "R".into(),
            capacity: 1,
            department: None,
            created_by: user,
            updated_by: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted_by: None,
        }
    }

    #[test]
    fn parse_roles() {
        let roles = StaticRoles::parse("1=admin,7= Professor ,").unwrap();
        assert_eq!(roles.role_of(1), Role::Admin);
        assert_eq!(roles.role_of(7), Role::Professor);
        assert_eq!(roles.role_of(8), Role::Student);
        assert!(StaticRoles::parse("").unwrap().roles.is_empty());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(
            StaticRoles::parse("1=wizard").unwrap_err(),
            RoleParseError::UnknownRole("wizard".into())
        );
        assert!(matches!(
            StaticRoles::parse("admin").unwrap_err(),
            RoleParseError::MalformedEntry(_)
        ));
        assert!(matches!(
            StaticRoles::parse("x=admin").unwrap_err(),
            RoleParseError::MalformedEntry(_)
        ));
    }

    #[test]
    fn levels_are_ordered() {
        let levels: Vec<u8> = [
            Role::Student,
            Role::Doorkeeper,
            Role::ClassRep,
            Role::Assistant,
            Role::Professor,
            Role::Admin,
        ]
        .iter()
        .map(|r| r.level())
        .collect();
        assert_eq!(levels, vec![10, 20, 30, 50, 70, 100]);
    }

    #[test]
    fn students_read_and_book() {
        let p = policy();
        let student = Actor::new(99);
        assert!(p.can_read(&student).is_ok());
        assert!(p.can_create_reservation(&student).is_ok());
        let err = p.can_edit_calendar(&student).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn reservation_owner_or_assistant_may_modify() {
        let p = policy();
        let mine = reservation_by(99);
        assert!(p.can_modify_reservation(&Actor::new(99), &mine).is_ok());
        assert!(p.can_modify_reservation(&Actor::new(2), &mine).is_ok());
        assert!(p.can_modify_reservation(&Actor::new(98), &mine).is_err());
        // Class reps are below assistant and not the owner.
        assert!(p.can_modify_reservation(&Actor::new(3), &mine).is_err());
    }

    #[test]
    fn calendar_deletes_need_admin() {
        let p = policy();
        assert!(p.can_edit_calendar(&Actor::new(2)).is_ok());
        assert!(p.can_delete_calendar_entry(&Actor::new(2)).is_err());
        assert!(p.can_delete_calendar_entry(&Actor::new(1)).is_ok());
    }

    #[test]
    fn room_delete_needs_admin_or_assistant_owner() {
        let p = policy();
        assert!(p.can_delete_room(&Actor::new(1), &room_by(2)).is_ok());
        assert!(p.can_delete_room(&Actor::new(2), &room_by(2)).is_ok());
        assert!(p.can_delete_room(&Actor::new(2), &room_by(5)).is_err());
        // Owning a room is not enough below assistant.
        assert!(p.can_delete_room(&Actor::new(3), &room_by(3)).is_err());
    }
}
