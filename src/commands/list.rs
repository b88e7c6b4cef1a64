use std::io::Write;

use anyhow::Result;

use crate::{
    refs::advertised_refs,
    storage::{KvStore, RepoNamespace},
};

/// Handle the list command
/// Output every ref as `<hash> <name>`, then `<hash> HEAD` if HEAD resolves,
/// then an empty line
pub fn handle<S: KvStore + ?Sized, W: Write>(
    store: &S,
    repo: &RepoNamespace,
    output: &mut W,
) -> Result<()> {
    let advertised = advertised_refs(store, repo)?;
    for (name, id) in &advertised.references {
        writeln!(output, "{} {}", id, name)?;
    }
    if let Some(head) = advertised.head {
        writeln!(output, "{} HEAD", head)?;
    }
    writeln!(output)?;
    Ok(())
}
