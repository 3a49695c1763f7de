//! Client commands and payload composition.
//!
//! Anything typed at the prompt that starts with `:` is a command; everything
//! else is chat. File transfers ride the ordinary record format: the payload
//! is a 16-byte NUL-padded basename block followed by the file bytes, and
//! receivers recognize the shape best-effort; there is no separate protocol.

use thiserror::Error;

use crate::wire::DATA_LEN_MAX;

/// Size of the basename block leading a file payload.
pub const BLOCK_LEN: usize = 16;

/// Largest file that fits in one record alongside its name block.
pub const FILE_MAX: usize = DATA_LEN_MAX - BLOCK_LEN;

/// One line of user input, classified.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    /// Blank line; nothing to send.
    Empty,
    /// Ordinary chat text.
    Chat(String),
    /// A `:command`.
    Command(Command),
}

/// The command set.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Command {
    /// `:q`, leave the chat.
    Quit,
    /// `:username`, pick a new display name.
    Username,
    /// `:fingerprint`, print the identity fingerprint.
    Fingerprint,
    /// `:file`, send a file to the group.
    File,
}

/// User-facing failures; the session keeps running after any of these.
#[derive(Debug, Error)]
pub enum UserError {
    /// Unrecognized `:command`.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    /// The file does not fit in a single record.
    #[error("file {name:?} is {over} bytes over the maximum supported size of {max} bytes")]
    OversizeFile {
        /// File the user asked to send.
        name: String,
        /// How far past the cap it is.
        over: u64,
        /// The cap itself.
        max: usize,
    },
    /// The path has no usable basename.
    #[error("cannot determine a file name for {0:?}")]
    NoFileName(String),
}

/// Classify one line of input.
pub fn parse(line: &str) -> Result<Input, UserError> {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return Ok(Input::Empty);
    }
    if !trimmed.starts_with(':') {
        return Ok(Input::Chat(trimmed.to_string()));
    }
    match trimmed {
        ":q" => Ok(Input::Command(Command::Quit)),
        ":username" => Ok(Input::Command(Command::Username)),
        ":fingerprint" => Ok(Input::Command(Command::Fingerprint)),
        ":file" => Ok(Input::Command(Command::File)),
        other => Err(UserError::UnknownCommand(other.to_string())),
    }
}

/// Compose a file payload: basename block ‖ file bytes.
///
/// Basenames longer than 15 bytes are truncated on a character boundary; the
/// block always keeps at least one trailing NUL so receivers can find the end
/// of the name.
pub fn pack_file(basename: &str, contents: &[u8]) -> Result<Vec<u8>, UserError> {
    if contents.len() > FILE_MAX {
        return Err(UserError::OversizeFile {
            name: basename.to_string(),
            over: (contents.len() - FILE_MAX) as u64,
            max: FILE_MAX,
        });
    }

    let mut end = basename.len().min(BLOCK_LEN - 1);
    while end > 0 && !basename.is_char_boundary(end) {
        end -= 1;
    }
    if end == 0 {
        return Err(UserError::NoFileName(basename.to_string()));
    }

    let mut payload = vec![0u8; BLOCK_LEN + contents.len()];
    payload[..end].copy_from_slice(&basename.as_bytes()[..end]);
    payload[BLOCK_LEN..].copy_from_slice(contents);
    Ok(payload)
}

/// Recognize a file payload and split it into name and contents.
///
/// Best-effort: the first block must be a NUL-terminated printable-ASCII
/// basename with no path separators, and file bytes must follow. Ordinary
/// chat text fails one of those tests and is rendered as a message instead.
pub fn unpack_file(payload: &[u8]) -> Option<(String, &[u8])> {
    if payload.len() <= BLOCK_LEN {
        return None;
    }
    let block = &payload[..BLOCK_LEN];
    let end = block.iter().position(|&b| b == 0)?;
    if end == 0 {
        return None;
    }
    let name = &block[..end];
    if block[end..].iter().any(|&b| b != 0) {
        return None;
    }
    let printable = name
        .iter()
        .all(|&b| b.is_ascii_graphic() || b == b' ');
    if !printable || name.contains(&b'/') || name.contains(&b'\\') {
        return None;
    }
    let name = String::from_utf8(name.to_vec()).ok()?;
    Some((name, &payload[BLOCK_LEN..]))
}
