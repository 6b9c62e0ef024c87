//! `--start-group … --end-group` semantics: the members of a group are
//! re-read until a pass adds no new symbols, so archives inside the group
//! can satisfy references introduced by later members.

use log::debug;

use crate::error::Result;
use crate::input::{archive, InputId, InputKind, ObjectReader};
use crate::module::Module;

/// Reads groups of archives to a fixpoint
pub struct GroupReader;

impl GroupReader {
    /// Re-read `members` until no pass extracts anything new.
    ///
    /// Non-archive members were already read in command-line order; only
    /// archive extraction can make progress on later passes.
    pub fn read_group(
        module: &mut Module,
        reader: &dyn ObjectReader,
        members: &[InputId],
    ) -> Result<()> {
        let mut pass = 0u32;
        loop {
            let mut progressed = false;
            for &member in members {
                if module.input(member).kind != InputKind::Archive {
                    continue;
                }
                progressed |= archive::extract_for_undefined(module, reader, member)?;
            }
            pass += 1;
            if !progressed {
                debug!("group converged after {pass} pass(es)");
                return Ok(());
            }
        }
    }
}
