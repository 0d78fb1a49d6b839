//! Episode cluster detection.
//!
//! Episode files of one series cluster tightly by size (bitrate × duration);
//! extras, menus, and trailers land in other bands. A coarse histogram picks
//! the densest size band and everything within ±20 % of that band's median is
//! treated as an episode.

use crate::types::{DetectionConfidence, DetectionResult, SourceFile};

const MIN_BIN_WIDTH: u64 = 50 * 1024 * 1024;
const BIN_TARGET: u64 = 20;
const WINDOW_LOW: f64 = 0.8;
const WINDOW_HIGH: f64 = 1.2;

/// Split `files` into episodes and non-episodes. The union of the two sets
/// is exactly the input and they are disjoint.
pub fn detect_episodes(files: &[SourceFile]) -> DetectionResult {
    match files.len() {
        0 => return DetectionResult::empty(),
        1 => return trivial(files, DetectionConfidence::Medium),
        2 => return trivial(files, DetectionConfidence::Low),
        _ => {}
    }

    let mut sizes: Vec<u64> = files.iter().map(|f| f.size_bytes).collect();
    sizes.sort_unstable();
    let min = sizes[0];
    let max = sizes[sizes.len() - 1];
    let bin_width = MIN_BIN_WIDTH.max((max - min) / BIN_TARGET).max(1);

    let bin_count = ((max - min) / bin_width + 1) as usize;
    let mut bins: Vec<Vec<u64>> = vec![Vec::new(); bin_count];
    for size in &sizes {
        let index = ((size - min) / bin_width) as usize;
        bins[index].push(*size);
    }

    // Densest bin wins; ties break toward smaller sizes.
    let (_, selected) = bins
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| a.len().cmp(&b.len()).then(ib.cmp(ia)))
        .map(|(i, b)| (i, b))
        .unwrap_or((0, &bins[0]));

    let cluster_median = median(selected);
    let low = cluster_median as f64 * WINDOW_LOW;
    let high = cluster_median as f64 * WINDOW_HIGH;

    let mut episodes = Vec::new();
    let mut non_episodes = Vec::new();
    for file in files {
        let size = file.size_bytes as f64;
        if size >= low && size <= high {
            episodes.push(file.clone());
        } else {
            non_episodes.push(file.clone());
        }
    }

    let confidence = grade(episodes.len(), files.len());
    let cluster_range = size_range(&episodes);

    DetectionResult {
        episodes,
        non_episodes,
        confidence,
        cluster_median,
        cluster_range,
    }
}

fn trivial(files: &[SourceFile], confidence: DetectionConfidence) -> DetectionResult {
    let episodes: Vec<SourceFile> = files.to_vec();
    let mut sizes: Vec<u64> = episodes.iter().map(|f| f.size_bytes).collect();
    sizes.sort_unstable();
    DetectionResult {
        cluster_median: median(&sizes),
        cluster_range: size_range(&episodes),
        episodes,
        non_episodes: Vec::new(),
        confidence,
    }
}

fn grade(episode_count: usize, total: usize) -> DetectionConfidence {
    let share = episode_count as f64 / total as f64;
    if episode_count >= 6 && share > 0.6 {
        DetectionConfidence::High
    } else if episode_count >= 3 {
        DetectionConfidence::Medium
    } else {
        DetectionConfidence::Low
    }
}

/// Median of an ascending slice; even counts average the two middle values.
fn median(sorted: &[u64]) -> u64 {
    match sorted.len() {
        0 => 0,
        n if n % 2 == 1 => sorted[n / 2],
        n => (sorted[n / 2 - 1] + sorted[n / 2]) / 2,
    }
}

fn size_range(files: &[SourceFile]) -> (u64, u64) {
    let min = files.iter().map(|f| f.size_bytes).min().unwrap_or(0);
    let max = files.iter().map(|f| f.size_bytes).max().unwrap_or(0);
    (min, max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file(name: &str, size: u64) -> SourceFile {
        SourceFile {
            path: PathBuf::from(format!("/disc/{name}")),
            relative_path: PathBuf::from(name),
            name: name.to_string(),
            size_bytes: size,
        }
    }

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    #[test]
    fn empty_input_yields_empty_low_confidence() {
        let result = detect_episodes(&[]);
        assert!(result.episodes.is_empty());
        assert!(result.non_episodes.is_empty());
        assert_eq!(result.confidence, DetectionConfidence::Low);
    }

    #[test]
    fn single_file_is_a_medium_confidence_episode() {
        let result = detect_episodes(&[file("only.mkv", GIB)]);
        assert_eq!(result.episodes.len(), 1);
        assert_eq!(result.confidence, DetectionConfidence::Medium);
        assert_eq!(result.cluster_median, GIB);
    }

    #[test]
    fn two_files_are_low_confidence_episodes() {
        let result = detect_episodes(&[file("a.mkv", GIB), file("b.mkv", 80 * MIB)]);
        assert_eq!(result.episodes.len(), 2);
        assert!(result.non_episodes.is_empty());
        assert_eq!(result.confidence, DetectionConfidence::Low);
    }

    #[test]
    fn happy_path_splits_menu_from_episodes() {
        let mut files: Vec<SourceFile> = (0..12)
            .map(|i| file(&format!("ep{i:02}.mkv"), 13 * GIB / 10 + i as u64 * 10 * MIB))
            .collect();
        files.push(file("menu.mkv", 80 * MIB));

        let result = detect_episodes(&files);
        assert_eq!(result.episodes.len(), 12);
        assert_eq!(result.non_episodes.len(), 1);
        assert_eq!(result.non_episodes[0].name, "menu.mkv");
        assert_eq!(result.confidence, DetectionConfidence::High);
    }

    #[test]
    fn partition_is_exact_and_disjoint() {
        let files: Vec<SourceFile> = (0..9)
            .map(|i| file(&format!("f{i}.mkv"), (i as u64 + 1) * 300 * MIB))
            .collect();
        let result = detect_episodes(&files);
        assert_eq!(
            result.episodes.len() + result.non_episodes.len(),
            files.len()
        );
        for episode in &result.episodes {
            assert!(!result.non_episodes.iter().any(|n| n.name == episode.name));
        }
    }

    #[test]
    fn window_bounds_are_respected() {
        let files = vec![
            file("a.mkv", 1000 * MIB),
            file("b.mkv", 1010 * MIB),
            file("c.mkv", 1020 * MIB),
            file("d.mkv", 790 * MIB),
            file("e.mkv", 1300 * MIB),
        ];
        let result = detect_episodes(&files);
        let low = result.cluster_median as f64 * 0.8;
        let high = result.cluster_median as f64 * 1.2;
        for episode in &result.episodes {
            let size = episode.size_bytes as f64;
            assert!(size >= low && size <= high);
        }
        for other in &result.non_episodes {
            let size = other.size_bytes as f64;
            assert!(size < low || size > high);
        }
    }

    #[test]
    fn two_clusters_drop_to_medium_confidence() {
        // 5 episodes around 1.1 GiB and 4 extras around 700 MiB: the denser
        // cluster wins but the 0.6 share rule keeps confidence medium.
        let mut files: Vec<SourceFile> = (0..5)
            .map(|i| file(&format!("ep{i}.mkv"), 1100 * MIB + i as u64 * 10 * MIB))
            .collect();
        for i in 0..4 {
            files.push(file(&format!("bonus{i}.mkv"), 700 * MIB + i as u64 * 20 * MIB));
        }

        let result = detect_episodes(&files);
        assert_eq!(result.confidence, DetectionConfidence::Medium);
        assert_eq!(result.episodes.len(), 5);
        assert!(result
            .non_episodes
            .iter()
            .all(|f| f.name.starts_with("bonus")));
    }

    #[test]
    fn tie_breaks_toward_smaller_sizes() {
        // Two equally-dense far-apart clusters; the smaller-size bin wins.
        let files = vec![
            file("small1.mkv", 100 * MIB),
            file("small2.mkv", 101 * MIB),
            file("small3.mkv", 102 * MIB),
            file("big1.mkv", 5 * GIB),
            file("big2.mkv", 5 * GIB + 10 * MIB),
            file("big3.mkv", 5 * GIB + 20 * MIB),
        ];
        let result = detect_episodes(&files);
        assert!(result.episodes.iter().all(|f| f.name.starts_with("small")));
    }

    #[test]
    fn identical_sizes_form_one_bin() {
        let files: Vec<SourceFile> = (0..7).map(|i| file(&format!("e{i}.mkv"), GIB)).collect();
        let result = detect_episodes(&files);
        assert_eq!(result.episodes.len(), 7);
        assert_eq!(result.confidence, DetectionConfidence::High);
        assert_eq!(result.cluster_median, GIB);
        assert_eq!(result.cluster_range, (GIB, GIB));
    }
}
