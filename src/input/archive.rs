//! Archive member bookkeeping and the extraction policy.
//!
//! An archive's index is read once and cached on the input. A member is
//! pulled into the link iff it defines a symbol that is currently an
//! undefined global, or unconditionally under `--whole-archive`.
//! Extraction is idempotent: an already-extracted member is never pulled
//! twice.

use std::collections::HashMap;

use log::debug;

use crate::error::Result;
use crate::input::{InputId, ObjectReader};
use crate::module::Module;

#[derive(Debug, Clone)]
/// One member recorded in the archive index
pub struct ArchiveMemberInfo {
    /// Member name inside the archive
    pub name: String,
    /// Global symbols the member defines
    pub defined: Vec<String>,
    /// Set once the member joined the link
    pub extracted: bool,
    /// The input created for the extracted member
    pub input: Option<InputId>,
}

#[derive(Debug, Clone, Default)]
/// The archive's symbol index, built once on first use
pub struct ArchiveIndex {
    /// Members in archive order
    pub members: Vec<ArchiveMemberInfo>,
    by_symbol: HashMap<String, usize>,
}

impl ArchiveIndex {
    /// Build an index over `members`; the first member defining a symbol
    /// wins the index slot, matching `ar` ranlib behavior
    pub fn new(members: Vec<ArchiveMemberInfo>) -> Self {
        let mut by_symbol = HashMap::new();
        for (idx, member) in members.iter().enumerate() {
            for sym in &member.defined {
                by_symbol.entry(sym.clone()).or_insert(idx);
            }
        }
        ArchiveIndex { members, by_symbol }
    }

    /// The member that would satisfy `symbol`, if any
    pub fn member_for_symbol(&self, symbol: &str) -> Option<usize> {
        self.by_symbol.get(symbol).copied()
    }

    /// Count of extracted members
    pub fn extracted_count(&self) -> usize {
        self.members.iter().filter(|m| m.extracted).count()
    }
}

/// Ensure the archive's index is cached on the input
pub fn ensure_index(
    module: &mut Module,
    reader: &dyn ObjectReader,
    archive: InputId,
) -> Result<()> {
    if module.input(archive).archive.is_some() {
        return Ok(());
    }
    let index = reader.archive_index(module, archive)?;
    module.input_mut(archive).archive = Some(index);
    Ok(())
}

/// Pull members that satisfy current undefined globals; under
/// `--whole-archive` pull everything. Returns true if any member joined
/// the link on this pass.
pub fn extract_for_undefined(
    module: &mut Module,
    reader: &dyn ObjectReader,
    archive: InputId,
) -> Result<bool> {
    ensure_index(module, reader, archive)?;
    let whole = module.input(archive).input.attrs.whole_archive;
    let mut any = false;
    loop {
        let candidate = {
            let index = module.input(archive).archive.as_ref();
            let Some(index) = index else { return Ok(any) };
            if whole {
                index.members.iter().position(|m| !m.extracted)
            } else {
                let mut found = None;
                for info in module.name_pool.undefined_globals() {
                    if let Some(idx) = index.member_for_symbol(&info.name) {
                        if !index.members[idx].extracted {
                            found = Some(idx);
                            break;
                        }
                    }
                }
                found
            }
        };
        let Some(member) = candidate else { break };
        let member_name = module.input(archive).archive.as_ref().and_then(|i| {
            i.members.get(member).map(|m| m.name.clone())
        });
        let extracted = reader.extract_member(module, archive, member)?;
        if let Some(index) = module.input_mut(archive).archive.as_mut() {
            index.members[member].extracted = true;
            index.members[member].input = Some(extracted);
        }
        module.input_mut(archive).used = true;
        debug!(
            "extracted {:?} from {}",
            member_name,
            module.input(archive).decorated_path()
        );
        any = true;
    }
    Ok(any)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_defining_member_wins_the_index() {
        let index = ArchiveIndex::new(vec![
            ArchiveMemberInfo {
                name: "a.o".into(),
                defined: vec!["foo".into()],
                extracted: false,
                input: None,
            },
            ArchiveMemberInfo {
                name: "b.o".into(),
                defined: vec!["foo".into(), "bar".into()],
                extracted: false,
                input: None,
            },
        ]);
        assert_eq!(index.member_for_symbol("foo"), Some(0));
        assert_eq!(index.member_for_symbol("bar"), Some(1));
        assert_eq!(index.member_for_symbol("baz"), None);
    }
}
