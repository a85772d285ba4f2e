//! Removal of one contiguous block of lines from a text file.

use std::fs;
use std::io;
use std::path::Path;

/// Remove the first block of `path` and rewrite the file without it.
///
/// The block starts at the first line for which `is_block_start` holds and
/// runs through every following line for which `is_block_continuation`
/// holds. Both predicates see the trimmed line. Only one block is removed;
/// the file is left untouched when no line starts a block.
///
/// Returns whether a block was removed.
pub fn excise<S, C>(path: &Path, mut is_block_start: S, mut is_block_continuation: C) -> io::Result<bool>
where
    S: FnMut(&str) -> bool,
    C: FnMut(&str) -> bool,
{
    let content = fs::read_to_string(path)?;
    let mut kept = String::with_capacity(content.len());

    #[derive(PartialEq)]
    enum Phase {
        Before,
        Inside,
        After,
    }
    let mut phase = Phase::Before;

    for line in content.split_inclusive('\n') {
        let trimmed = line.trim();
        phase = match phase {
            Phase::Before => {
                if is_block_start(trimmed) {
                    Phase::Inside
                } else {
                    Phase::Before
                }
            }
            Phase::Inside => {
                if is_block_continuation(trimmed) {
                    Phase::Inside
                } else {
                    Phase::After
                }
            }
            Phase::After => Phase::After,
        };
        if phase != Phase::Inside {
            kept.push_str(line);
        }
    }

    if phase == Phase::Before {
        return Ok(false);
    }
    fs::write(path, kept)?;
    Ok(true)
}
