//! Guest identity persistence.
//!
//! A visitor without a staff token chats under a locally minted guest id.
//! The id is written to the session directory so that a reload continues
//! the same conversations.

use std::io;
use std::path::{Path, PathBuf};

use clinichat_proto::message::ParticipantId;

/// File name of the stored guest id inside the session directory.
pub const GUEST_ID_FILE: &str = "guest-id";

/// Path of the guest id file inside `session_dir`.
#[must_use]
pub fn guest_id_path(session_dir: &Path) -> PathBuf {
    session_dir.join(GUEST_ID_FILE)
}

/// Returns the stored guest id, minting and storing a new one if there is
/// none or the stored one is not a guest id.
///
/// # Errors
///
/// Returns an I/O error if the session directory cannot be created or the
/// id file cannot be read or written.
pub fn load_or_mint_guest(session_dir: &Path) -> io::Result<ParticipantId> {
    let path = guest_id_path(session_dir);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let id = ParticipantId::new(contents.trim());
            if id.is_guest() {
                tracing::debug!(guest = %id, "reusing stored guest id");
                return Ok(id);
            }
            tracing::warn!(path = %path.display(), "stored guest id is invalid, minting a new one");
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    std::fs::create_dir_all(session_dir)?;
    let id = ParticipantId::mint_guest();
    std::fs::write(&path, id.as_str())?;
    tracing::info!(guest = %id, "minted guest id");
    Ok(id)
}
