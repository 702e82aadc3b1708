use std::path::Path;

use anyhow::Result;
use log::{error, info};
use tokio::fs;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() || fs::try_exists(path).await? {
        return Ok(());
    }

    if let Err(e) = fs::create_dir_all(path).await {
        error!("Failed to create directory at {:?}: {}", path, e);
        return Err(e.into());
    }
    info!("Created directory at: {:?}", path);
    Ok(())
}

/// Renders a payload for display: UTF-8 text when valid, hex bytes otherwise
pub fn describe_payload(data: &[u8]) -> String {
    match std::str::from_utf8(data) {
        Ok(text) => text.to_string(),
        Err(_) => data
            .iter()
            .map(|byte| format!("{:02X}", byte))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_payload_prefers_text() {
        assert_eq!(describe_payload(b"OK+CONN"), "OK+CONN");
        assert_eq!(describe_payload(&[0xff, 0x00, 0x1a]), "FF 00 1A");
    }

    #[tokio::test]
    async fn ensure_directory_exists_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("hm10-serial-utils-{}", std::process::id()));
        ensure_directory_exists(&dir).await.unwrap();
        ensure_directory_exists(&dir).await.unwrap();
        assert!(dir.is_dir());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
