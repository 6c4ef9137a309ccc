//! Definition output writer.

use std::fs;
use std::io::{self, Write};

use prost::Message;

use crate::pb;

/// Serialize `def` to its wire encoding.
pub fn encode_definition(def: &pb::Definition) -> Vec<u8> {
    def.encode_to_vec()
}

/// Write the encoded definition to `output`, or to stdout when `output`
/// is empty or `-`.
pub fn write_definition(def: &pb::Definition, output: &str) -> io::Result<()> {
    let bytes = encode_definition(def);
    if output.is_empty() || output == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle.write_all(&bytes)?;
        handle.flush()
    } else {
        fs::write(output, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_file_decodes_back() {
        let def = pb::Definition {
            def: vec![vec![1, 2, 3]],
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pb");
        write_definition(&def, path.to_str().unwrap()).unwrap();
        let bytes = fs::read(&path).unwrap();
        let decoded = pb::Definition::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, def);
    }

    #[test]
    fn encoding_is_stable() {
        let def = pb::Definition {
            def: vec![b"op".to_vec()],
            ..Default::default()
        };
        assert_eq!(encode_definition(&def), encode_definition(&def));
    }
}
