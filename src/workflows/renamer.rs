use std::path::{Path, PathBuf};

use crate::domain::models::EpisodeCandidate;

pub fn generate_filename(
    show_name: &str,
    season: u64,
    episode: u64,
    episode_title: &str,
    extension: &str,
) -> String {
    format!(
        "{} - S{:02}E{:02} - {}.{extension}",
        sanitize_filename(show_name),
        season,
        episode,
        sanitize_filename(episode_title)
    )
}

fn sanitize_filename(name: &str) -> String {
    // Remove or replace invalid filename characters
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Folder of one season inside the library: `<library>/<Show>/Season <n>`.
pub fn season_dir(library: &Path, show_name: &str, season: u64) -> PathBuf {
    library
        .join(sanitize_filename(show_name))
        .join(format!("Season {season}"))
}

/// Free destination for `episode` in the library layout.
pub fn library_path(
    library: &Path,
    show_name: &str,
    episode: &EpisodeCandidate,
    extension: &str,
) -> PathBuf {
    let directory = season_dir(library, show_name, episode.season);
    let filename = generate_filename(
        show_name,
        episode.season,
        episode.episode,
        &episode.title,
        extension,
    );
    find_unique_filename(&directory, &filename)
}

pub fn find_unique_filename(directory: &Path, base_filename: &str) -> PathBuf {
    let mut path = directory.join(base_filename);
    let mut counter = 1;

    while path.exists() {
        let stem = Path::new(base_filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("file");
        let extension = Path::new(base_filename)
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("mkv");

        let new_filename = format!("{stem} [copy {counter}].{extension}");
        path = directory.join(new_filename);
        counter += 1;
    }

    path
}
