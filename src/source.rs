//! Source acquisition: shallow clones of remote repositories and extraction
//! of uploaded archives into per-deployment build contexts.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{Error, Result};

/// Shallow-clones `repo_url` at `branch` into `dest`, wiping anything already
/// there. When the requested branch does not exist the conventional sibling
/// (`main` <-> `master`) is tried before giving up.
pub async fn clone_repo(
    repo_url: &str,
    dest: &Path,
    branch: &str,
    token: Option<&str>,
) -> Result<()> {
    let url = authenticated_url(repo_url, token);
    let dest = dest.to_path_buf();
    let branch = branch.to_string();
    let display_url = repo_url.to_string();

    tokio::task::spawn_blocking(move || clone_blocking(&url, &dest, &branch, &display_url))
        .await
        .map_err(|error| Error::SourceFetch(error.to_string()))?
}

fn clone_blocking(url: &str, dest: &Path, branch: &str, display_url: &str) -> Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    info!(repo = display_url, branch, "cloning repository");

    match try_clone(url, dest, branch) {
        Ok(()) => Ok(()),
        Err(first_error) => {
            let alt_branch = if branch == "main" { "master" } else { "main" };
            warn!(branch, alt_branch, "branch not found, trying the alternative");

            // A failed attempt can leave a partial checkout behind.
            if dest.exists() {
                let _ = fs::remove_dir_all(dest);
            }

            try_clone(url, dest, alt_branch).map_err(|second_error| {
                Error::SourceFetch(format!(
                    "Failed to clone repository. Branch '{branch}' ({first_error}) and \
                     '{alt_branch}' ({second_error}) not found."
                ))
            })
        }
    }
}

fn try_clone(url: &str, dest: &Path, branch: &str) -> std::result::Result<(), git2::Error> {
    let mut fetch = git2::FetchOptions::new();
    fetch.depth(1);

    let mut builder = git2::build::RepoBuilder::new();
    builder.branch(branch);
    builder.fetch_options(fetch);
    builder.clone(url, dest)?;

    Ok(())
}

/// Embeds the token into an https clone URL; ssh remotes are converted to
/// https first since workers carry no ssh keys.
fn authenticated_url(repo_url: &str, token: Option<&str>) -> String {
    let Some(token) = token else {
        return repo_url.to_string();
    };

    let mut url = repo_url.to_string();
    if let Some(path) = url.strip_prefix("git@github.com:") {
        url = format!("https://github.com/{}", path.trim_end_matches(".git"));
    }

    if let Some(rest) = url.strip_prefix("https://") {
        // Drop any credentials already baked into the URL.
        let host_and_path = rest.rsplit('@').next().unwrap_or(rest);
        return format!("https://{token}@{host_and_path}");
    }

    url
}

/// Extracts an uploaded zip archive into `dest` and unwraps a single
/// top-level directory, so `project.zip` containing `project/...` behaves the
/// same as one zipped from inside the project root.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;

    let file = fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    zip.extract(dest)?;

    flatten_single_top_dir(dest)
}

pub fn flatten_single_top_dir(dir: &Path) -> Result<()> {
    let entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;

    if let [only] = entries.as_slice() {
        let top = only.path();
        if top.is_dir() {
            for item in fs::read_dir(&top)? {
                let item = item?;
                fs::rename(item.path(), dir.join(item.file_name()))?;
            }
            fs::remove_dir(&top)?;
        }
    }

    Ok(())
}

/// Keeps only the base name of an uploaded file name; anything path-like in
/// it is hostile.
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim_start_matches('.');

    if base.is_empty() {
        "upload.zip".to_string()
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    use super::*;

    fn write_zip(path: &Path, files: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, content) in files {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn archive_with_wrapping_directory_is_unwrapped() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("project.zip");
        write_zip(
            &archive,
            &[
                ("project/package.json", "{}"),
                ("project/src/index.js", "console.log(1)"),
            ],
        );

        let dest = dir.path().join("out");
        extract_archive(&archive, &dest).unwrap();

        assert!(dest.join("package.json").exists());
        assert!(dest.join("src/index.js").exists());
        assert!(!dest.join("project").exists());
    }

    #[test]
    fn flat_archive_stays_flat() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("site.zip");
        write_zip(&archive, &[("index.html", "<html></html>"), ("app.js", "")]);

        let dest = dir.path().join("out");
        extract_archive(&archive, &dest).unwrap();

        assert!(dest.join("index.html").exists());
        assert!(dest.join("app.js").exists());
    }

    #[test]
    fn token_is_embedded_into_https_urls() {
        assert_eq!(
            authenticated_url("https://github.com/me/repo.git", Some("tok")),
            "https://tok@github.com/me/repo.git"
        );
        assert_eq!(
            authenticated_url("https://old@github.com/me/repo.git", Some("tok")),
            "https://tok@github.com/me/repo.git"
        );
        assert_eq!(
            authenticated_url("git@github.com:me/repo.git", Some("tok")),
            "https://tok@github.com/me/repo"
        );
        assert_eq!(
            authenticated_url("https://github.com/me/repo.git", None),
            "https://github.com/me/repo.git"
        );
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\temp\\site.zip"), "site.zip");
        assert_eq!(sanitize_filename("app.zip"), "app.zip");
        assert_eq!(sanitize_filename(""), "upload.zip");
    }
}
