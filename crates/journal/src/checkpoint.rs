//! Checkpoint metadata scans

use lfsgc_core::{ControlError, CpMode, FsControl};

/// Entries requested per checkpoint scan
pub const CPINFO_BATCH: usize = 512;

/// Checkpoint numbers of every snapshot, ascending
///
/// Follows the snapshot list through each entry's `next` link, so the
/// cost is proportional to the number of snapshots rather than checkpoints.
pub fn snapshot_numbers(control: &dyn FsControl) -> Result<Vec<u64>, ControlError> {
    let mut numbers = Vec::new();
    let mut start = 0;
    loop {
        let batch = control.checkpoint_info(start, CpMode::Snapshot, CPINFO_BATCH)?;
        let Some(last) = batch.last() else {
            break;
        };
        let next = last.next;
        numbers.extend(batch.iter().filter(|cp| cp.is_snapshot()).map(|cp| cp.cno));
        if next == 0 || next <= start {
            break;
        }
        start = next;
    }
    numbers.sort_unstable();
    numbers.dedup();
    Ok(numbers)
}
