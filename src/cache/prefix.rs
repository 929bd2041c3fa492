//! Prefix matching between input sequences.

use crate::cache::input::Input;

/// Length of the common leading run of `a` and `b`.
///
/// Stops at the first position where the inputs differ or at the end of the
/// shorter sequence. Multimodal items match on content hash only.
pub fn common_prefix_len(a: &[Input], b: &[Input]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
