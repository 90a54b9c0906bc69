//! Shared plain-HTTP retrieval for providers without a custom transfer
//! protocol.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::RANGE;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::file::{File, hex_encode};
use crate::retriever::RetrieveContext;

use super::ProviderError;

/// Streams the file's URL into `ctx.dest_dir`, returning the written path.
///
/// A pre-existing partial file is resumed with a `Range` request unless
/// `ctx.no_continue` is set or the remote ignores the range. When the file
/// metadata advertises a sha256 checksum, the written bytes are verified
/// before returning.
pub(crate) async fn fetch_to_file(
    file: &File,
    ctx: &RetrieveContext<'_>,
) -> Result<PathBuf, ProviderError> {
    let url = file.url().clone();
    let dest = ctx.dest_dir.join(safe_name(file.name()));

    let existing = if ctx.no_continue {
        0
    } else {
        fs::metadata(&dest).await.map(|meta| meta.len()).unwrap_or(0)
    };

    let mut request = ctx.client.get(url.clone());
    if existing > 0 {
        request = request.header(RANGE, format!("bytes={existing}-"));
    }
    let response = request
        .send()
        .await
        .map_err(|error| ProviderError::transport(&url, &error))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::status(&url, status));
    }

    // A 200 despite our Range header means the remote restarts from zero.
    let resuming = existing > 0 && status == StatusCode::PARTIAL_CONTENT;
    let output = if resuming {
        fs::OpenOptions::new().append(true).open(&dest).await
    } else {
        fs::File::create(&dest).await
    }
    .map_err(|error| ProviderError::io(&dest, &error))?;

    ctx.progress.start_at(if resuming { existing } else { 0 });
    debug!(url = %url, dest = %dest.display(), resuming, "transferring");

    let mut writer = BufWriter::new(output);
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| ProviderError::transport(&url, &error))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|error| ProviderError::io(&dest, &error))?;
        ctx.progress.add(chunk.len() as u64);
    }
    writer
        .flush()
        .await
        .map_err(|error| ProviderError::io(&dest, &error))?;

    verify_checksum(file, &dest).await?;
    Ok(dest)
}

/// Returns true when the destination already holds the file: it exists and
/// matches the advertised size (any size when the length is unknown).
pub(crate) async fn matches_existing(file: &File, dest_dir: &Path) -> bool {
    let dest = dest_dir.join(safe_name(file.name()));
    match fs::metadata(&dest).await {
        Ok(meta) => file.size().is_none_or(|size| meta.len() == size),
        Err(_) => false,
    }
}

async fn verify_checksum(file: &File, path: &Path) -> Result<(), ProviderError> {
    let Some(checksum) = file.checksum() else {
        return Ok(());
    };
    if checksum.algo != "sha256" {
        warn!(
            algo = %checksum.algo,
            file = file.name(),
            "unsupported checksum algorithm, skipping verification"
        );
        return Ok(());
    }

    let mut reader = fs::File::open(path)
        .await
        .map_err(|error| ProviderError::io(path, &error))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; 64 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .await
            .map_err(|error| ProviderError::io(path, &error))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let actual = hex_encode(&hasher.finalize());
    if actual == checksum.sum {
        Ok(())
    } else {
        Err(ProviderError::checksum_mismatch(
            file.name(),
            checksum.sum.clone(),
            actual,
        ))
    }
}

/// Keeps the destination inside the download directory.
fn safe_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "download".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::safe_name;

    #[test]
    fn test_safe_name_passes_plain_names() {
        assert_eq!(safe_name("a.bin"), "a.bin");
    }

    #[test]
    fn test_safe_name_flattens_separators() {
        assert_eq!(safe_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(safe_name("a\\b"), "a_b");
    }

    #[test]
    fn test_safe_name_rejects_empty_and_dots() {
        assert_eq!(safe_name(""), "download");
        assert_eq!(safe_name("."), "download");
        assert_eq!(safe_name(".."), "download");
    }
}
