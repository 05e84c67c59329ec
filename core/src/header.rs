//! Character name extraction
//!
//! The game stores the character's name as a zero-terminated string at a
//! fixed offset in the save header, encoded in code page 866.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use encoding_rs::IBM866;

use crate::error::{GuardError, HeaderError, IoContext};

/// Byte offset of the name field in a character file.
pub const NAME_OFFSET: u64 = 12;

/// Read the display name from a save header.
pub fn read_character_name<R: Read + Seek>(reader: &mut R) -> Result<String, HeaderError> {
    reader.seek(SeekFrom::Start(NAME_OFFSET))?;

    let mut raw = Vec::new();
    let read = BufReader::new(reader).read_until(0, &mut raw)?;

    if read == 0 {
        return Err(HeaderError::Truncated {
            offset: NAME_OFFSET,
        });
    }
    if raw.pop() != Some(0) {
        return Err(HeaderError::Unterminated);
    }

    let (name, _) = IBM866.decode_without_bom_handling(&raw);
    Ok(name.into_owned())
}

/// Open `path` and read its display name.
pub fn read_character_name_from_path(path: &Path) -> Result<String, GuardError> {
    let mut file = File::open(path).at(path)?;
    read_character_name(&mut file).map_err(|source| GuardError::Header {
        path: path.to_path_buf(),
        source,
    })
}
