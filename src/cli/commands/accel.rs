use anyhow::Result;

use mycelium::{Accelerators, cid};

pub(crate) fn cmd_accel() -> Result<()> {
    let accels = Accelerators::defaults()?;
    for accel in accels.iter() {
        println!(
            "{:<14} {} -> {}  {}",
            accel.name,
            accel.input,
            accel.output,
            cid::to_text(&accel.fingerprint())
        );
    }
    Ok(())
}
