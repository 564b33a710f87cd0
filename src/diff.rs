use crate::operation::Operation;

/// Compute the operations that transform `old` into `new`.
///
/// The longest common prefix and suffix are identified first and only the
/// differing middle span is described, so pure appends and truncations come out
/// as a single Insert or Delete rather than a full-content Replace. The result
/// is not guaranteed globally minimal, but `apply_batch(old, diff(old, new))`
/// always equals `new`. Positions are character offsets.
pub fn diff(old: &str, new: &str) -> Vec<Operation> {
    if old == new {
        return Vec::new();
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let mut prefix = 0;
    while prefix < old_chars.len()
        && prefix < new_chars.len()
        && old_chars[prefix] == new_chars[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < old_chars.len() - prefix
        && suffix < new_chars.len() - prefix
        && old_chars[old_chars.len() - 1 - suffix] == new_chars[new_chars.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let old_middle_len = old_chars.len() - prefix - suffix;
    let new_middle: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    let op = if old_middle_len == 0 {
        Operation::insert(prefix, new_middle)
    } else if new_middle.is_empty() {
        Operation::delete(prefix, old_middle_len)
    } else {
        Operation::replace(prefix, old_middle_len, new_middle)
    };

    vec![op]
}
