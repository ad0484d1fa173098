use super::{json_pretty, CommandError, CommandResult, EXIT_PROTOCOL_ERROR, EXIT_SUCCESS};
use imgdelta_schema::{Consumed, DeltaMetadata, HeaderParser, ProtocolError};
use std::io::Read;
use std::path::Path;

/// Decode and print the metadata at the front of a delta without reading
/// the batch that follows.
pub fn run(input: Option<&Path>, json: bool) -> CommandResult {
    let (metadata, header_len) = match input {
        Some(path) => {
            let file = std::fs::File::open(path)
                .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
            read_header(file)?
        }
        None => read_header(std::io::stdin().lock())?,
    };

    if json {
        println!("{}", json_pretty(&metadata)?);
    } else {
        println!("version:      {}", metadata.version);
        println!("header_bytes: {header_len}");
        println!(
            "config:       {}",
            json_pretty(&metadata.docker_config)?
        );
    }
    Ok(EXIT_SUCCESS)
}

/// Returns the metadata and the header length including the separator.
fn read_header(mut reader: impl Read) -> Result<(DeltaMetadata, usize), CommandError> {
    let mut parser = HeaderParser::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut chunk)
            .map_err(|e| format!("failed to read delta: {e}"))?;
        if n == 0 {
            return Err(protocol(&parser.finish()));
        }
        let before = parser.buffered();
        match parser.push(&chunk[..n]).map_err(|e| protocol(&e))? {
            Consumed::NeedMore => {}
            Consumed::Complete {
                metadata,
                remainder,
            } => return Ok((metadata, before + n - remainder.len())),
        }
    }
}

fn protocol(e: &ProtocolError) -> CommandError {
    CommandError::new(EXIT_PROTOCOL_ERROR, format!("protocol error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgdelta_schema::encode_header;

    #[test]
    fn reads_header_and_ignores_batch() {
        let mut bytes =
            encode_header(&DeltaMetadata::new(serde_json::json!({"Cmd": ["sh"]}))).unwrap();
        let header_len = bytes.len();
        bytes.extend_from_slice(b"batch\x00bytes");

        let (metadata, len) = read_header(bytes.as_slice()).unwrap();
        assert_eq!(metadata.docker_config, serde_json::json!({"Cmd": ["sh"]}));
        assert_eq!(len, header_len);
    }

    #[test]
    fn truncated_header_is_protocol_error() {
        let err = read_header(&b"{\"version\":2"[..]).unwrap_err();
        assert_eq!(err.code, EXIT_PROTOCOL_ERROR);
        assert!(err.message.contains("protocol error"));
    }

    #[test]
    fn unknown_version_is_protocol_error() {
        let err = read_header(&b"{\"version\":3}\x00"[..]).unwrap_err();
        assert_eq!(err.code, EXIT_PROTOCOL_ERROR);
    }
}
