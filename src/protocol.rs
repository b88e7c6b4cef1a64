//! Entry points the surrounding ledger routes to: the push message and the
//! read-only queries.

use std::sync::Arc;

use crate::{
    commands::push::{self, PushReport, PushRequest},
    config::ServiceConfig,
    error::{Error, Result},
    refs::{advertised_refs, list_refs},
    storage::{KvStore, RepoNamespace},
};

pub struct GitService<S: KvStore + ?Sized> {
    store: Arc<S>,
    config: ServiceConfig,
}

impl<S: KvStore + ?Sized + 'static> GitService<S> {
    pub fn new(store: Arc<S>, config: ServiceConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn push(&self, request: &PushRequest) -> Result<PushReport> {
        push::handle(&self.store, request, &self.config)
    }

    /// Answer a query addressed as `<endpoint>/<owner>/<name>`, returning JSON.
    pub fn query(&self, path: &str) -> Result<Vec<u8>> {
        let (endpoint, rest) = path.split_once('/').unwrap_or((path, ""));
        tracing::debug!("query {} for '{}'", endpoint, rest);
        match endpoint {
            "listRefs" => {
                let repo = RepoNamespace::parse(rest)?;
                Ok(serde_json::to_vec(&list_refs(self.store.as_ref(), &repo)?)?)
            }
            "advertisedReferences" => {
                let repo = RepoNamespace::parse(rest)?;
                Ok(serde_json::to_vec(&advertised_refs(self.store.as_ref(), &repo)?)?)
            }
            other => Err(Error::UnknownQuery(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use gix_object::Kind;

    use super::*;
    use crate::{
        pack::{encode_objects, GitObject},
        refs::{AdvertisedRefs, RefUpdateCommand},
        storage::MemoryStore,
    };

    fn service() -> GitService<MemoryStore> {
        GitService::new(Arc::new(MemoryStore::new()), ServiceConfig::default())
    }

    #[test]
    fn test_queries_after_push() {
        let service = service();
        let blob = GitObject::from_raw(Kind::Blob, b"readme\n".to_vec());
        let report = service
            .push(&PushRequest {
                namespace: "o/r".to_string(),
                author: "o".to_string(),
                commands: vec![RefUpdateCommand::create("refs/heads/master", blob.id)],
                packfile: encode_objects(&[blob.clone()]).unwrap().0,
                shallow: None,
            })
            .unwrap();
        assert!(report.accepted());

        let names: Vec<String> =
            serde_json::from_slice(&service.query("listRefs/o/r").unwrap()).unwrap();
        assert_eq!(names, vec!["refs/heads/master"]);

        let adv: AdvertisedRefs =
            serde_json::from_slice(&service.query("advertisedReferences/o/r").unwrap()).unwrap();
        assert_eq!(adv.head, Some(blob.id));
        assert_eq!(adv.references.get("refs/heads/master"), Some(&blob.id));
    }

    #[test]
    fn test_unknown_endpoint_and_bad_namespace() {
        let service = service();
        assert!(matches!(service.query("fetch/o/r"), Err(Error::UnknownQuery(_))));
        assert!(matches!(service.query("listRefs/o"), Err(Error::InvalidNamespace(_))));
        assert!(matches!(service.query("listRefs"), Err(Error::InvalidNamespace(_))));
    }
}
