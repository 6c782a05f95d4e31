//! The trivial jobs: reporting configuration and target identities.

use crate::{caller::Caller, config::{DaemonConfig, Target}, error::Result};
use std::io::Write;

/// Print the caller config path.
pub fn do_getconf(caller: &Caller) -> Result<()> {
    let path = DaemonConfig::caller_config_path(&caller.user, caller.num);
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    writeln!(stdout, "{}", path)?;
    stdout.flush()?;
    Ok(())
}

/// Print `<uid>:<gid>` of the selected target.
pub fn do_getugid(target: &Target) -> Result<()> {
    let stdout = std::io::stdout();
    let mut stdout = stdout.lock();
    writeln!(stdout, "{}:{}", target.uid, target.gid)?;
    stdout.flush()?;
    Ok(())
}
