//! Handle push: ingest the pack, then update references

use std::{fmt, io::Write, sync::Arc};

use crate::{
    config::ServiceConfig,
    error::{Error, Result},
    pack::{receive_pack, IngestOutcome, ObjectId},
    refs::{initialize_repository, RefStatus, RefUpdateCommand, ReferenceUpdateApplier},
    storage::{KvStore, RepoNamespace},
};

/// A push as delivered by the surrounding transaction layer
#[derive(Clone, PartialEq, Eq)]
pub struct PushRequest {
    /// Repository as `owner/name`
    pub namespace: String,
    pub author: String,
    pub commands: Vec<RefUpdateCommand>,
    pub packfile: Vec<u8>,
    /// Shallow boundary advertised by the client
    pub shallow: Option<ObjectId>,
}

impl fmt::Debug for PushRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushRequest")
            .field("namespace", &self.namespace)
            .field("author", &self.author)
            .field("commands", &self.commands)
            .field("packfile_len", &self.packfile.len())
            .field("shallow", &self.shallow)
            .finish()
    }
}

impl PushRequest {
    /// Stateless checks; returns the parsed namespace.
    pub fn validate_basic(&self) -> Result<RepoNamespace> {
        if self.author.trim().is_empty() {
            return Err(Error::MissingAuthor);
        }
        let repo = RepoNamespace::parse(&self.namespace)?;
        if self.commands.is_empty() {
            return Err(Error::EmptyCommandList);
        }
        for command in &self.commands {
            command.validate()?;
        }
        Ok(repo)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackStatus {
    Ok(IngestOutcome),
    Failed(String),
}

/// Outcome of a push, per reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub unpack: UnpackStatus,
    pub refs: Vec<(String, RefStatus)>,
}

impl PushReport {
    fn unpack_failed(commands: &[RefUpdateCommand], reason: String) -> Self {
        Self {
            unpack: UnpackStatus::Failed(reason),
            refs: commands
                .iter()
                .map(|c| (c.name.clone(), RefStatus::NotAttempted))
                .collect(),
        }
    }

    /// Whether the pack was ingested and every reference was updated
    pub fn accepted(&self) -> bool {
        matches!(self.unpack, UnpackStatus::Ok(_)) && self.refs.iter().all(|(_, s)| s.is_ok())
    }

    pub fn status(&self, name: &str) -> Option<&RefStatus> {
        self.refs.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// First reference that did not apply, with the reason
    pub fn first_failure(&self) -> Option<(&str, String)> {
        self.refs
            .iter()
            .find(|(_, s)| !s.is_ok())
            .map(|(name, status)| (name.as_str(), self.reason(status)))
    }

    fn reason(&self, status: &RefStatus) -> String {
        match (&self.unpack, status) {
            (UnpackStatus::Failed(_), RefStatus::NotAttempted) => "unpacker error".to_string(),
            _ => status.to_string(),
        }
    }

    /// Render as Git `report-status` lines.
    pub fn write_report<W: Write>(&self, output: &mut W) -> std::io::Result<()> {
        match &self.unpack {
            UnpackStatus::Ok(_) => writeln!(output, "unpack ok")?,
            UnpackStatus::Failed(reason) => writeln!(output, "unpack {}", reason)?,
        }
        for (name, status) in &self.refs {
            if status.is_ok() {
                writeln!(output, "ok {}", name)?;
            } else {
                writeln!(output, "ng {} {}", name, self.reason(status))?;
            }
        }
        Ok(())
    }
}

/// Handle a push request
///
/// Request-level problems (bad namespace, malformed commands, storage
/// failures) are errors and leave the store untouched where possible.
/// Pack and reference failures are reported in the returned report.
pub fn handle<S>(
    store: &Arc<S>,
    request: &PushRequest,
    config: &ServiceConfig,
) -> Result<PushReport>
where
    S: KvStore + ?Sized + 'static,
{
    let repo = request.validate_basic()?;
    tracing::info!(
        "push to {} by {}: {} commands, {} pack bytes",
        repo,
        request.author,
        request.commands.len(),
        request.packfile.len()
    );
    if let Some(shallow) = request.shallow {
        tracing::debug!("client shallow boundary {}", shallow);
    }

    initialize_repository(store.as_ref(), &repo, &config.default_head)?;

    let outcome = receive_pack(
        &mut request.packfile.as_slice(),
        Arc::clone(store),
        &repo,
        config.decoder_options(),
        config.ingest_chunk_size,
    );
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(Error::Storage(e)) => return Err(Error::Storage(e)),
        Err(e) => {
            tracing::warn!("rejecting pack for {}: {}", repo, e);
            return Ok(PushReport::unpack_failed(&request.commands, e.to_string()));
        }
    };

    let report = ReferenceUpdateApplier::new(store.as_ref(), &repo)
        .mode(config.ref_update_mode())
        .default_head(config.default_head.clone())
        .apply(&request.commands)?;

    let report = PushReport {
        unpack: UnpackStatus::Ok(outcome),
        refs: report.statuses,
    };
    match report.first_failure() {
        Some((name, reason)) => tracing::warn!("push to {} rejected at {}: {}", repo, name, reason),
        None => tracing::info!("push to {} accepted", repo),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use gix_object::Kind;

    use super::*;
    use crate::{
        error::ConflictKind,
        pack::{encode_objects, GitObject},
        storage::MemoryStore,
    };

    fn request(commands: Vec<RefUpdateCommand>, packfile: Vec<u8>) -> PushRequest {
        PushRequest {
            namespace: "alice/project".to_string(),
            author: "alice".to_string(),
            commands,
            packfile,
            shallow: None,
        }
    }

    fn pack_of(objects: &[GitObject]) -> Vec<u8> {
        encode_objects(objects).unwrap().0
    }

    #[test]
    fn test_validate_basic() {
        let id = ObjectId::from_bytes([1; 20]);
        let good = request(vec![RefUpdateCommand::create("refs/heads/x", id)], vec![]);
        assert!(good.validate_basic().is_ok());

        let mut no_author = good.clone();
        no_author.author = " ".to_string();
        assert!(matches!(no_author.validate_basic(), Err(Error::MissingAuthor)));

        let mut bad_ns = good.clone();
        bad_ns.namespace = String::new();
        assert!(matches!(bad_ns.validate_basic(), Err(Error::InvalidNamespace(_))));

        let mut no_commands = good.clone();
        no_commands.commands.clear();
        assert!(matches!(no_commands.validate_basic(), Err(Error::EmptyCommandList)));
    }

    #[test]
    fn test_push_stores_pack_and_refs() {
        let store = Arc::new(MemoryStore::new());
        let blob = GitObject::from_raw(Kind::Blob, b"content\n".to_vec());
        let req = request(
            vec![RefUpdateCommand::create("refs/heads/master", blob.id)],
            pack_of(&[blob.clone()]),
        );

        let report = handle(&store, &req, &ServiceConfig::default()).unwrap();
        assert!(report.accepted());
        let mut out = Vec::new();
        report.write_report(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "unpack ok\nok refs/heads/master\n");

        let repo = RepoNamespace::parse("alice/project").unwrap();
        assert_eq!(
            store.get(&repo.ref_key("refs/heads/master")).unwrap(),
            Some(format!("{}\n", blob.id).into_bytes())
        );
        assert_eq!(store.list_keys(&repo.packs_prefix()).unwrap().len(), 2);
    }

    #[test]
    fn test_bad_pack_reports_unpack_failure_and_touches_no_refs() {
        let store = Arc::new(MemoryStore::new());
        let id = ObjectId::from_bytes([1; 20]);
        let req = request(
            vec![RefUpdateCommand::create("refs/heads/master", id)],
            b"PACK garbage".to_vec(),
        );

        let report = handle(&store, &req, &ServiceConfig::default()).unwrap();
        assert!(!report.accepted());
        assert!(matches!(report.unpack, UnpackStatus::Failed(_)));
        assert_eq!(
            report.first_failure().map(|(n, r)| (n.to_string(), r)),
            Some(("refs/heads/master".to_string(), "unpacker error".to_string()))
        );
        let repo = RepoNamespace::parse("alice/project").unwrap();
        assert!(store.list_keys(&repo.refs_prefix()).unwrap().is_empty());
        assert!(store.list_keys(&repo.packs_prefix()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_reference_name_rejects_whole_request() {
        let store = Arc::new(MemoryStore::new());
        let id = ObjectId::from_bytes([1; 20]);
        let req = request(vec![RefUpdateCommand::create("heads/x", id)], vec![]);

        assert!(matches!(
            handle(&store, &req, &ServiceConfig::default()),
            Err(Error::InvalidReferenceName(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_ref_conflict_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let blob = GitObject::from_raw(Kind::Blob, b"v1".to_vec());
        let req = request(
            vec![RefUpdateCommand::create("refs/heads/master", blob.id)],
            pack_of(&[blob]),
        );
        assert!(handle(&store, &req, &ServiceConfig::default()).unwrap().accepted());

        let again = handle(&store, &req, &ServiceConfig::default()).unwrap();
        assert!(!again.accepted());
        assert_eq!(
            again.status("refs/heads/master"),
            Some(&RefStatus::Failed(ConflictKind::AlreadyExists))
        );
        let mut out = Vec::new();
        again.write_report(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "unpack ok\nng refs/heads/master reference already exists\n"
        );
    }
}
