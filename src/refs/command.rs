use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::REFS_PREFIX;
use crate::{
    error::{Error, Result},
    pack::ObjectId,
};

/// What a command does, derived from which of its hashes are zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefAction {
    Create,
    Update,
    Delete,
    Invalid,
}

impl fmt::Display for RefAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefAction::Create => "create",
            RefAction::Update => "update",
            RefAction::Delete => "delete",
            RefAction::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// One `old new name` line of a push
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefUpdateCommand {
    pub name: String,
    pub old: ObjectId,
    pub new: ObjectId,
}

impl RefUpdateCommand {
    pub fn new(name: impl Into<String>, old: ObjectId, new: ObjectId) -> Self {
        Self {
            name: name.into(),
            old,
            new,
        }
    }

    pub fn create(name: impl Into<String>, new: ObjectId) -> Self {
        Self::new(name, ObjectId::ZERO, new)
    }

    pub fn update(name: impl Into<String>, old: ObjectId, new: ObjectId) -> Self {
        Self::new(name, old, new)
    }

    pub fn delete(name: impl Into<String>, old: ObjectId) -> Self {
        Self::new(name, old, ObjectId::ZERO)
    }

    pub fn action(&self) -> RefAction {
        match (self.old.is_zero(), self.new.is_zero()) {
            (true, true) => RefAction::Invalid,
            (true, false) => RefAction::Create,
            (false, true) => RefAction::Delete,
            (false, false) => RefAction::Update,
        }
    }

    /// Check the name and classification; returns the action to perform.
    pub fn validate(&self) -> Result<RefAction> {
        if !self.name.starts_with(REFS_PREFIX) || self.name.len() == REFS_PREFIX.len() {
            return Err(Error::InvalidReferenceName(self.name.clone()));
        }
        if self
            .name
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(Error::InvalidReferenceName(self.name.clone()));
        }
        match self.action() {
            RefAction::Invalid => Err(Error::InvalidCommand(self.name.clone())),
            action => Ok(action),
        }
    }
}

/// Parses `<old>:<new>:<name>`
impl FromStr for RefUpdateCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (old, new, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(old), Some(new), Some(name)) => (old, new, name),
            _ => return Err(Error::InvalidCommand(s.to_string())),
        };
        let parse =
            |hex: &str| ObjectId::from_hex(hex).ok_or_else(|| Error::InvalidCommand(s.to_string()));
        Ok(Self::new(name, parse(old)?, parse(new)?))
    }
}

impl fmt::Display for RefUpdateCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.old, self.new, self.name)
    }
}
