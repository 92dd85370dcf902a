use std::sync::LazyLock;

use regex::Regex;

static SXEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)s(\d{1,2})e(\d{1,3})").expect("episode regex is valid"));

// Bounded so resolution tags like 1920x1080 don't match
static X_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(\d{1,2})x(\d{1,3})\b").expect("episode regex is valid"));

/// Extract `(season, episode)` from a file name.
///
/// `S01E02` anywhere in the name wins over `1x02`.
pub fn parse_episode(name: &str) -> Option<(u32, u32)> {
    [&*SXEX_RE, &*X_RE].into_iter().find_map(|re| {
        let caps = re.captures(name)?;
        let season = caps.get(1)?.as_str().parse().ok()?;
        let episode = caps.get(2)?.as_str().parse().ok()?;
        Some((season, episode))
    })
}

/// Order file names by season then episode.
///
/// Names without a recognisable episode marker are dropped from the result,
/// so callers must expect a file to be missing from the ordering.
pub fn sort_episodes<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    let mut episodes: Vec<((u32, u32), &str)> = names
        .iter()
        .filter_map(|name| {
            let name = name.as_ref();
            parse_episode(name).map(|key| (key, name))
        })
        .collect();

    episodes.sort_by_key(|(key, _)| *key);
    episodes
        .into_iter()
        .map(|(_, name)| name.to_string())
        .collect()
}

/// Entry following `current` in an already sorted list
pub fn next_after<'a>(sorted: &'a [String], current: &str) -> Option<&'a str> {
    let position = sorted.iter().position(|name| name == current)?;
    sorted.get(position + 1).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_episode_forms() {
        assert_eq!(parse_episode("Show.S01E02.720p.mkv"), Some((1, 2)));
        assert_eq!(parse_episode("show s1e10 web.mkv"), Some((1, 10)));
        assert_eq!(parse_episode("Show 2x05.avi"), Some((2, 5)));
        assert_eq!(parse_episode("Show 02X115.avi"), Some((2, 115)));
        assert_eq!(parse_episode("Extras.mkv"), None);
    }

    #[test]
    fn test_resolution_tag_is_not_an_episode() {
        assert_eq!(parse_episode("Show 1920x1080 S01E02.mkv"), Some((1, 2)));
        assert_eq!(parse_episode("Show.1280x720.mkv"), None);

        let sorted = sort_episodes(&[
            "Show 1920x1080 S01E02.mkv",
            "Show 1920x1080 S01E01.mkv",
            "Show S01E03.mkv",
        ]);
        assert_eq!(
            sorted,
            vec![
                "Show 1920x1080 S01E01.mkv",
                "Show 1920x1080 S01E02.mkv",
                "Show S01E03.mkv"
            ]
        );
    }

    #[test]
    fn test_sort_episodes() {
        let sorted = sort_episodes(&["Show S01E02.mkv", "Show S01E01.mkv", "Show S02E01.mkv"]);
        assert_eq!(
            sorted,
            vec!["Show S01E01.mkv", "Show S01E02.mkv", "Show S02E01.mkv"]
        );
    }

    #[test]
    fn test_sort_numbers_not_lexically() {
        let sorted = sort_episodes(&["Show.S01E10.mkv", "Show.S01E02.mkv", "Show.S01E01.mkv"]);
        assert_eq!(
            sorted,
            vec!["Show.S01E01.mkv", "Show.S01E02.mkv", "Show.S01E10.mkv"]
        );
    }

    #[test]
    fn test_unmatched_names_are_dropped() {
        let sorted = sort_episodes(&["Show S01E02.mkv", "Extras.mkv", "Show S01E01.mkv"]);
        assert_eq!(sorted, vec!["Show S01E01.mkv", "Show S01E02.mkv"]);
        assert!(!sorted.iter().any(|n| n == "Extras.mkv"));
    }

    #[test]
    fn test_mixed_forms_sort_together() {
        let sorted = sort_episodes(&["Show 1x03.mkv", "Show S01E01.mkv", "Show 1x02.mkv"]);
        assert_eq!(sorted, vec!["Show S01E01.mkv", "Show 1x02.mkv", "Show 1x03.mkv"]);
    }

    #[test]
    fn test_equal_keys_keep_input_order() {
        let sorted = sort_episodes(&["B S01E01.mkv", "A S01E01.mkv"]);
        assert_eq!(sorted, vec!["B S01E01.mkv", "A S01E01.mkv"]);
    }

    #[test]
    fn test_next_after() {
        let sorted = sort_episodes(&["S01E01", "S01E02"]);
        assert_eq!(next_after(&sorted, "S01E01"), Some("S01E02"));
        assert_eq!(next_after(&sorted, "S01E02"), None);
        assert_eq!(next_after(&sorted, "Extras"), None);
    }
}
