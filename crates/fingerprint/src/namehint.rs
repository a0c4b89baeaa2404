//! Backup label suggestions.
//!
//! Media sets are usually folders named `<prefix><number>` with a shared
//! prefix and a contiguous numeric range; the hint compresses such a set into
//! a compact label.

use std::path::{Path, PathBuf};

use regex::Regex;

/// Derives a label from a set of folder names.
///
/// All basenames must have the same length and end in equal-width numeric
/// suffixes forming a contiguous range; otherwise there is no hint. The range
/// renders as `prefixNNNN` for one folder, `prefixNNNN,MMMM` for two adjacent
/// ones and `prefixNNNN => MMMM` for longer runs, keeping the zero padding of
/// the original suffixes.
pub fn backup_name_hint(folders: &[PathBuf]) -> Option<String> {
    let mut names: Vec<String> = folders
        .iter()
        .map(|folder| {
            Path::new(folder)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .collect();
    names.sort();

    let first_name = names.first()?;

    if names.iter().any(|name| name.len() != first_name.len()) {
        return None;
    }

    let suffix_pattern = Regex::new("^.*-([0-9]+)$").ok()?;
    let mut suffixes = Vec::with_capacity(names.len());

    for name in &names {
        let captures = suffix_pattern.captures(name)?;
        suffixes.push(captures.get(1)?.as_str().to_owned());
    }

    let suffix_length = suffixes[0].len();

    if suffixes.iter().any(|suffix| suffix.len() != suffix_length) {
        return None;
    }

    let numbers: Vec<u64> = suffixes
        .iter()
        .map(|suffix| suffix.parse().ok())
        .collect::<Option<_>>()?;
    let first = *numbers.iter().min()?;
    let last = *numbers.iter().max()?;

    if numbers != (first..=last).collect::<Vec<_>>() {
        return None;
    }

    let prefix = &names[0][..first_name.len() - suffix_length];
    let first_str = format!("{first:0suffix_length$}");
    let last_str = format!("{last:0suffix_length$}");

    if last == first {
        Some(format!("{prefix}{first_str}"))
    } else if last == first + 1 {
        Some(format!("{prefix}{first_str},{last_str}"))
    } else {
        Some(format!("{prefix}{first_str} => {last_str}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(folders: &[&str]) -> Option<String> {
        backup_name_hint(&folders.iter().map(PathBuf::from).collect::<Vec<_>>())
    }

    #[test]
    fn single_folder() {
        assert_eq!(hint(&["/p/FG-2020-0003"]), Some("FG-2020-0003".into()));
    }

    #[test]
    fn two_adjacent_folders() {
        assert_eq!(
            hint(&["/p/FG-2020-0003", "/p/FG-2020-0004"]),
            Some("FG-2020-0003,0004".into())
        );
    }

    #[test]
    fn contiguous_range() {
        assert_eq!(
            hint(&["/p/FG-2020-0007", "/p/FG-2020-0008", "/p/FG-2020-0009"]),
            Some("FG-2020-0007 => 0009".into())
        );
    }

    #[test]
    fn non_contiguous_range() {
        assert_eq!(
            hint(&["/p/FG-2020-0004", "/p/FG-2020-0006", "/p/FG-2020-0007"]),
            None
        );
    }

    #[test]
    fn unsorted_input_is_sorted_first() {
        assert_eq!(
            hint(&["/p/FG-2020-0008", "/p/FG-2020-0007"]),
            Some("FG-2020-0007,0008".into())
        );
    }

    #[test]
    fn mismatched_name_lengths() {
        assert_eq!(hint(&["/p/FG-2020-0003", "/p/FG-2020-00004"]), None);
    }

    #[test]
    fn missing_numeric_suffix() {
        assert_eq!(hint(&["/p/FG-2020-line"]), None);
    }

    #[test]
    fn duplicate_suffixes() {
        assert_eq!(hint(&["/a/FG-2020-0003", "/b/FG-2020-0003"]), None);
    }

    #[test]
    fn empty_input() {
        assert_eq!(hint(&[]), None);
    }

    #[test]
    fn padding_is_preserved() {
        assert_eq!(
            hint(&["/p/DISC-08", "/p/DISC-09", "/p/DISC-10"]),
            Some("DISC-08 => 10".into())
        );
    }
}
