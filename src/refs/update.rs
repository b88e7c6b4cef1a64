//! Applying reference commands to a repository namespace.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

use super::{command::RefAction, value::RefValue, RefUpdateCommand, DEFAULT_HEAD};
use crate::{
    error::{ConflictKind, Error, Result},
    storage::{KvMutation, KvStore, RepoNamespace},
};

/// Configuration blob written into a freshly initialized repository
pub const BARE_CONFIG: &str = "[core]\n\trepositoryformatversion = 0\n\tbare = true\n";

/// Write `HEAD` and `config` if the repository has never been initialized.
///
/// Returns whether anything was written.
pub fn initialize_repository<S: KvStore + ?Sized>(
    store: &S,
    repo: &RepoNamespace,
    default_head: &str,
) -> Result<bool> {
    if store.has(&repo.head_key()).map_err(Error::Storage)? {
        return Ok(false);
    }
    let head = if default_head.is_empty() {
        DEFAULT_HEAD
    } else {
        default_head
    };
    tracing::info!("initializing repository {} (HEAD -> {})", repo, head);
    store
        .write_batch(vec![
            KvMutation::Set {
                key: repo.head_key(),
                value: RefValue::Symbolic(head.to_string()).encode(),
            },
            KvMutation::Set {
                key: repo.config_key(),
                value: BARE_CONFIG.as_bytes().to_vec(),
            },
        ])
        .map_err(Error::Storage)?;
    Ok(true)
}

/// How a batch reacts to a failed precondition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefUpdateMode {
    /// Stop at the first failure; earlier commands stay applied.
    #[default]
    Sequential,
    /// Apply everything or nothing.
    Atomic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefStatus {
    Ok,
    Failed(ConflictKind),
    /// An earlier command in the batch failed
    NotAttempted,
    /// Would have succeeded, but the atomic batch was abandoned
    RolledBack,
}

impl RefStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RefStatus::Ok)
    }
}

impl fmt::Display for RefStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefStatus::Ok => f.write_str("ok"),
            RefStatus::Failed(kind) => write!(f, "{}", kind),
            RefStatus::NotAttempted => f.write_str("not attempted"),
            RefStatus::RolledBack => f.write_str("atomic push failed"),
        }
    }
}

/// Per-reference outcome, in command order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefUpdateReport {
    pub statuses: Vec<(String, RefStatus)>,
}

impl RefUpdateReport {
    pub fn is_success(&self) -> bool {
        self.statuses.iter().all(|(_, status)| status.is_ok())
    }

    pub fn status(&self, name: &str) -> Option<&RefStatus> {
        self.statuses
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, status)| status)
    }

    pub fn first_failure(&self) -> Option<(&str, ConflictKind)> {
        self.statuses.iter().find_map(|(name, status)| match status {
            RefStatus::Failed(kind) => Some((name.as_str(), *kind)),
            _ => None,
        })
    }

    /// `Ok(())` if every command applied, otherwise the first conflict.
    pub fn into_result(self) -> Result<()> {
        match self.first_failure() {
            Some((name, kind)) => Err(Error::ReferenceConflict {
                name: name.to_string(),
                kind,
            }),
            None => Ok(()),
        }
    }
}

pub struct ReferenceUpdateApplier<'a, S: KvStore + ?Sized> {
    store: &'a S,
    repo: &'a RepoNamespace,
    mode: RefUpdateMode,
    default_head: String,
}

impl<'a, S: KvStore + ?Sized> ReferenceUpdateApplier<'a, S> {
    pub fn new(store: &'a S, repo: &'a RepoNamespace) -> Self {
        Self {
            store,
            repo,
            mode: RefUpdateMode::default(),
            default_head: DEFAULT_HEAD.to_string(),
        }
    }

    pub fn mode(mut self, mode: RefUpdateMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn default_head(mut self, head: impl Into<String>) -> Self {
        self.default_head = head.into();
        self
    }

    /// Validate every command, initialize the repository if needed, then
    /// apply the commands in order.
    ///
    /// Malformed commands are request errors and nothing is written.
    /// Precondition failures are reported per reference.
    pub fn apply(&self, commands: &[RefUpdateCommand]) -> Result<RefUpdateReport> {
        if commands.is_empty() {
            return Err(Error::EmptyCommandList);
        }
        let actions = commands
            .iter()
            .map(RefUpdateCommand::validate)
            .collect::<Result<Vec<_>>>()?;

        initialize_repository(self.store, self.repo, &self.default_head)?;

        match self.mode {
            RefUpdateMode::Sequential => self.apply_sequential(commands, &actions),
            RefUpdateMode::Atomic => self.apply_atomic(commands, &actions),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.store.has(key).map_err(Error::Storage)
    }

    fn mutation(&self, command: &RefUpdateCommand, action: RefAction) -> KvMutation {
        let key = self.repo.ref_key(&command.name);
        match action {
            RefAction::Delete => KvMutation::Delete { key },
            _ => KvMutation::Set {
                key,
                value: RefValue::Direct(command.new).encode(),
            },
        }
    }

    fn apply_sequential(
        &self,
        commands: &[RefUpdateCommand],
        actions: &[RefAction],
    ) -> Result<RefUpdateReport> {
        let mut report = RefUpdateReport::default();
        let mut failed = false;

        for (command, &action) in commands.iter().zip(actions) {
            if failed {
                report
                    .statuses
                    .push((command.name.clone(), RefStatus::NotAttempted));
                continue;
            }
            let exists = self.exists(&self.repo.ref_key(&command.name))?;
            if let Some(kind) = conflict(action, exists) {
                tracing::warn!("{} {} rejected: {}", action, command.name, kind);
                report
                    .statuses
                    .push((command.name.clone(), RefStatus::Failed(kind)));
                failed = true;
                continue;
            }

            let written = match self.mutation(command, action) {
                KvMutation::Set { key, value } => self.store.set(&key, &value),
                KvMutation::Delete { key } => self.store.delete(&key),
            };
            written.map_err(Error::Storage)?;
            tracing::info!("{} {} -> {}", action, command.name, command.new);
            report.statuses.push((command.name.clone(), RefStatus::Ok));
        }
        Ok(report)
    }

    fn apply_atomic(
        &self,
        commands: &[RefUpdateCommand],
        actions: &[RefAction],
    ) -> Result<RefUpdateReport> {
        // existence as seen by later commands in the same batch
        let mut staged: HashMap<String, bool> = HashMap::new();
        let mut mutations = Vec::with_capacity(commands.len());

        for (i, (command, &action)) in commands.iter().zip(actions).enumerate() {
            let key = self.repo.ref_key(&command.name);
            let exists = match staged.get(&key) {
                Some(&exists) => exists,
                None => self.exists(&key)?,
            };
            if let Some(kind) = conflict(action, exists) {
                tracing::warn!(
                    "{} {} rejected: {}; abandoning atomic batch",
                    action,
                    command.name,
                    kind
                );
                let statuses = commands
                    .iter()
                    .enumerate()
                    .map(|(j, c)| {
                        let status = match j.cmp(&i) {
                            std::cmp::Ordering::Less => RefStatus::RolledBack,
                            std::cmp::Ordering::Equal => RefStatus::Failed(kind),
                            std::cmp::Ordering::Greater => RefStatus::NotAttempted,
                        };
                        (c.name.clone(), status)
                    })
                    .collect();
                return Ok(RefUpdateReport { statuses });
            }
            staged.insert(key, action != RefAction::Delete);
            mutations.push(self.mutation(command, action));
        }

        self.store.write_batch(mutations).map_err(Error::Storage)?;
        for (command, action) in commands.iter().zip(actions) {
            tracing::info!("{} {} -> {}", action, command.name, command.new);
        }
        Ok(RefUpdateReport {
            statuses: commands
                .iter()
                .map(|c| (c.name.clone(), RefStatus::Ok))
                .collect(),
        })
    }
}

fn conflict(action: RefAction, exists: bool) -> Option<ConflictKind> {
    match (action, exists) {
        (RefAction::Create, true) => Some(ConflictKind::AlreadyExists),
        (RefAction::Update | RefAction::Delete, false) => Some(ConflictKind::DoesNotExist),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pack::ObjectId, storage::MemoryStore};

    fn oid(b: u8) -> ObjectId {
        ObjectId::from_bytes([b; 20])
    }

    fn repo() -> RepoNamespace {
        RepoNamespace::parse("alice/project").unwrap()
    }

    fn read_ref(store: &MemoryStore, name: &str) -> Option<RefValue> {
        store
            .get(&repo().ref_key(name))
            .unwrap()
            .and_then(|bytes| RefValue::parse(&bytes))
    }

    #[test]
    fn test_initializes_repository_once() {
        let store = MemoryStore::new();
        assert!(initialize_repository(&store, &repo(), DEFAULT_HEAD).unwrap());
        assert!(!initialize_repository(&store, &repo(), "refs/heads/main").unwrap());

        assert_eq!(
            store.get(&repo().head_key()).unwrap(),
            Some(b"ref: refs/heads/master\n".to_vec())
        );
        assert_eq!(
            store.get(&repo().config_key()).unwrap(),
            Some(BARE_CONFIG.as_bytes().to_vec())
        );
    }

    #[test]
    fn test_create_update_delete_lifecycle() {
        let store = MemoryStore::new();
        let repo = repo();
        let applier = ReferenceUpdateApplier::new(&store, &repo);

        let report = applier
            .apply(&[RefUpdateCommand::create("refs/heads/x", oid(1))])
            .unwrap();
        assert!(report.is_success());
        assert_eq!(read_ref(&store, "refs/heads/x"), Some(RefValue::Direct(oid(1))));

        let again = applier
            .apply(&[RefUpdateCommand::create("refs/heads/x", oid(1))])
            .unwrap();
        assert_eq!(
            again.status("refs/heads/x"),
            Some(&RefStatus::Failed(ConflictKind::AlreadyExists))
        );
        assert!(matches!(
            again.into_result(),
            Err(Error::ReferenceConflict { kind: ConflictKind::AlreadyExists, .. })
        ));

        applier
            .apply(&[RefUpdateCommand::update("refs/heads/x", oid(1), oid(2))])
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(read_ref(&store, "refs/heads/x"), Some(RefValue::Direct(oid(2))));

        applier
            .apply(&[RefUpdateCommand::delete("refs/heads/x", oid(2))])
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(read_ref(&store, "refs/heads/x"), None);

        let missing = applier
            .apply(&[RefUpdateCommand::delete("refs/heads/x", oid(2))])
            .unwrap();
        assert_eq!(
            missing.first_failure(),
            Some(("refs/heads/x", ConflictKind::DoesNotExist))
        );
    }

    #[test]
    fn test_update_of_missing_ref_fails() {
        let store = MemoryStore::new();
        let repo = repo();
        let report = ReferenceUpdateApplier::new(&store, &repo)
            .apply(&[RefUpdateCommand::update("refs/heads/y", oid(1), oid(2))])
            .unwrap();
        assert_eq!(
            report.status("refs/heads/y"),
            Some(&RefStatus::Failed(ConflictKind::DoesNotExist))
        );
    }

    #[test]
    fn test_invalid_commands_abort_before_any_write() {
        let store = MemoryStore::new();
        let repo = repo();
        let applier = ReferenceUpdateApplier::new(&store, &repo);

        let result = applier.apply(&[
            RefUpdateCommand::create("refs/heads/ok", oid(1)),
            RefUpdateCommand::create("heads/x", oid(2)),
        ]);
        assert!(matches!(result, Err(Error::InvalidReferenceName(_))));
        assert!(store.is_empty());

        assert!(matches!(applier.apply(&[]), Err(Error::EmptyCommandList)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_sequential_keeps_earlier_and_skips_later() {
        let store = MemoryStore::new();
        let repo = repo();
        let applier = ReferenceUpdateApplier::new(&store, &repo);

        let report = applier
            .apply(&[
                RefUpdateCommand::create("refs/heads/a", oid(1)),
                RefUpdateCommand::delete("refs/heads/missing", oid(1)),
                RefUpdateCommand::create("refs/heads/c", oid(3)),
            ])
            .unwrap();

        assert_eq!(report.status("refs/heads/a"), Some(&RefStatus::Ok));
        assert_eq!(
            report.status("refs/heads/missing"),
            Some(&RefStatus::Failed(ConflictKind::DoesNotExist))
        );
        assert_eq!(report.status("refs/heads/c"), Some(&RefStatus::NotAttempted));
        assert!(read_ref(&store, "refs/heads/a").is_some());
        assert!(read_ref(&store, "refs/heads/c").is_none());
    }

    #[test]
    fn test_atomic_failure_writes_nothing() {
        let store = MemoryStore::new();
        let repo = repo();
        let applier = ReferenceUpdateApplier::new(&store, &repo).mode(RefUpdateMode::Atomic);

        let report = applier
            .apply(&[
                RefUpdateCommand::create("refs/heads/a", oid(1)),
                RefUpdateCommand::delete("refs/heads/missing", oid(1)),
                RefUpdateCommand::create("refs/heads/c", oid(3)),
            ])
            .unwrap();

        assert_eq!(report.status("refs/heads/a"), Some(&RefStatus::RolledBack));
        assert_eq!(report.status("refs/heads/c"), Some(&RefStatus::NotAttempted));
        assert!(read_ref(&store, "refs/heads/a").is_none());
        // initialization is not part of the batch
        assert!(store.has(&repo.head_key()).unwrap());
    }

    #[test]
    fn test_atomic_sees_its_own_staged_changes() {
        let store = MemoryStore::new();
        let repo = repo();
        let applier = ReferenceUpdateApplier::new(&store, &repo).mode(RefUpdateMode::Atomic);

        let report = applier
            .apply(&[
                RefUpdateCommand::create("refs/heads/a", oid(1)),
                RefUpdateCommand::update("refs/heads/a", oid(1), oid(2)),
                RefUpdateCommand::create("refs/tags/v1", oid(9)),
            ])
            .unwrap();

        assert!(report.is_success());
        assert_eq!(read_ref(&store, "refs/heads/a"), Some(RefValue::Direct(oid(2))));
        assert_eq!(read_ref(&store, "refs/tags/v1"), Some(RefValue::Direct(oid(9))));
    }
}
