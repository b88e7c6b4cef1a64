use std::io::Write;

use anyhow::{Context, Result};

use crate::{
    refs::advertised_refs,
    storage::{KvStore, RepoNamespace},
};

/// Handle the advertised-refs command
/// Output the advertised references as one JSON document
pub fn handle<S: KvStore + ?Sized, W: Write>(
    store: &S,
    repo: &RepoNamespace,
    output: &mut W,
) -> Result<()> {
    let advertised = advertised_refs(store, repo)?;
    serde_json::to_writer_pretty(&mut *output, &advertised)
        .context("Failed to serialize advertised references")?;
    writeln!(output)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{refs::AdvertisedRefs, storage::MemoryStore};

    #[test]
    fn test_outputs_json() -> Result<()> {
        let store = MemoryStore::new();
        let repo = RepoNamespace::parse("o/r")?;
        let mut out = Vec::new();
        handle(&store, &repo, &mut out)?;

        let parsed: AdvertisedRefs = serde_json::from_slice(&out)?;
        assert_eq!(parsed.head, None);
        assert!(parsed.capabilities.contains(&"report-status".to_string()));
        Ok(())
    }
}
