use std::io::IsTerminal;

use anyhow::{Context, Result, bail};
use dialoguer::Confirm;

/// Ask before a destructive schema change. `--yes` skips the prompt; without
/// it a non-interactive session is refused rather than assumed to agree.
pub fn confirm(action: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }

    if !std::io::stdin().is_terminal() {
        bail!("refusing to {action} without confirmation in a non-interactive session, pass --yes");
    }

    Confirm::new()
        .with_prompt(format!("Really {action}?"))
        .default(false)
        .interact()
        .context("confirmation cancelled")
}
