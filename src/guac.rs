//! Guacamole instruction protocol: length-prefixed textual instructions of the
//! form `N.value,M.value,...;` where `N` is the decimal byte length of the
//! element that follows. This module owns the codec and the client-side
//! `select → args → size/audio/video/image → connect → ready` handshake spoken
//! to a local guacd.

use std::collections::HashMap;
use std::io::{Read, Write};

/// One decoded instruction: opcode plus arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    pub fn new(opcode: impl Into<String>, args: Vec<String>) -> Self {
        Self { opcode: opcode.into(), args }
    }

    /// Encode into the wire form, length-prefixing each element with its byte
    /// length.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}.{}", self.opcode.len(), self.opcode));
        for arg in &self.args {
            out.push_str(&format!(",{}.{}", arg.len(), arg));
        }
        out.push(';');
        out
    }

    /// Parse a single complete instruction (must end with `;`).
    pub fn parse(raw: &str) -> anyhow::Result<Instruction> {
        let bytes = raw.as_bytes();
        if bytes.last() != Some(&b';') {
            anyhow::bail!("instruction not terminated: {}", raw);
        }
        let mut elements = Vec::new();
        let mut pos = 0usize;
        loop {
            let dot = bytes[pos..]
                .iter()
                .position(|&b| b == b'.')
                .ok_or_else(|| anyhow::anyhow!("missing length separator in {}", raw))?;
            let len: usize = std::str::from_utf8(&bytes[pos..pos + dot])?
                .parse()
                .map_err(|_| anyhow::anyhow!("bad element length in {}", raw))?;
            let start = pos + dot + 1;
            let end = start + len;
            if end >= bytes.len() {
                anyhow::bail!("element length overruns instruction: {}", raw);
            }
            elements.push(String::from_utf8(bytes[start..end].to_vec())?);
            match bytes[end] {
                b',' => pos = end + 1,
                b';' => break,
                other => anyhow::bail!("unexpected separator {:?} in {}", other as char, raw),
            }
        }
        let mut it = elements.into_iter();
        let opcode = it.next().unwrap_or_default();
        Ok(Instruction { opcode, args: it.collect() })
    }
}

/// Incremental parser over a byte stream. Feed raw reads in, pull complete
/// raw instructions (terminator included) out; partial tail bytes stay
/// buffered until the next feed.
#[derive(Default)]
pub struct InstructionParser {
    buf: Vec<u8>,
}

impl InstructionParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete instruction as raw text, or `None` if the
    /// buffer holds only a partial one.
    pub fn next_raw(&mut self) -> anyhow::Result<Option<String>> {
        let mut pos = 0usize;
        loop {
            let Some(dot) = self.buf[pos..].iter().position(|&b| b == b'.') else {
                return Ok(None);
            };
            let len: usize = std::str::from_utf8(&self.buf[pos..pos + dot])?
                .parse()
                .map_err(|_| anyhow::anyhow!("bad element length in guacd stream"))?;
            let end = pos + dot + 1 + len;
            if end >= self.buf.len() {
                return Ok(None);
            }
            match self.buf[end] {
                b',' => pos = end + 1,
                b';' => {
                    let rest = self.buf.split_off(end + 1);
                    let raw = std::mem::replace(&mut self.buf, rest);
                    return Ok(Some(String::from_utf8(raw)?));
                }
                other => anyhow::bail!("unexpected separator {:?} in guacd stream", other as char),
            }
        }
    }
}

/// Connection parameters for the guacd handshake. `value_for` answers the
/// parameter names guacd advertises in its `args` instruction; names are
/// normalized to the dashed form guacd uses.
#[derive(Debug, Clone)]
pub struct GuacdParams {
    pub protocol: String,
    pub hostname: String,
    pub port: String,
    pub username: String,
    pub password: String,
    pub width: String,
    pub height: String,
    pub dpi: String,
    /// 可选连接参数（如 ignore-cert / security / recording-path 等）
    pub extra: HashMap<String, String>,
}

impl GuacdParams {
    fn value_for(&self, arg_name: &str) -> String {
        let key = arg_name.replace('_', "-");
        match key.as_str() {
            "hostname" => self.hostname.clone(),
            "port" => self.port.clone(),
            "username" => self.username.clone(),
            "password" => self.password.clone(),
            "width" => self.width.clone(),
            "height" => self.height.clone(),
            "dpi" => self.dpi.clone(),
            _ => self.extra.get(&key).cloned().unwrap_or_default(),
        }
    }
}

fn read_instruction<S: Read>(
    stream: &mut S,
    parser: &mut InstructionParser,
) -> anyhow::Result<Instruction> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(raw) = parser.next_raw()? {
            return Instruction::parse(&raw);
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            anyhow::bail!("guacd closed the connection during handshake");
        }
        parser.feed(&chunk[..n]);
    }
}

/// Drive the client handshake. On success returns the connection id carried
/// by guacd's `ready` instruction. guacd lists the parameter names it wants
/// in its `args` reply; the `connect` instruction answers them positionally,
/// echoing `VERSION_*` tokens and leaving unknown names empty.
pub fn handshake<S: Read + Write>(stream: &mut S, params: &GuacdParams) -> anyhow::Result<String> {
    let mut parser = InstructionParser::new();

    stream
        .write_all(Instruction::new("select", vec![params.protocol.clone()]).encode().as_bytes())?;
    let args = read_instruction(stream, &mut parser)?;
    if args.opcode != "args" {
        anyhow::bail!("expected args from guacd, got {}", args.opcode);
    }

    stream.write_all(
        Instruction::new(
            "size",
            vec![params.width.clone(), params.height.clone(), params.dpi.clone()],
        )
        .encode()
        .as_bytes(),
    )?;
    stream.write_all(Instruction::new("audio", vec![]).encode().as_bytes())?;
    stream.write_all(Instruction::new("video", vec![]).encode().as_bytes())?;
    stream.write_all(Instruction::new("image", vec![]).encode().as_bytes())?;

    let values = args
        .args
        .iter()
        .map(|name| {
            if name.starts_with("VERSION") { name.clone() } else { params.value_for(name) }
        })
        .collect();
    stream.write_all(Instruction::new("connect", values).encode().as_bytes())?;
    stream.flush()?;

    let ready = read_instruction(stream, &mut parser)?;
    if ready.opcode != "ready" {
        anyhow::bail!("guacd refused the connection: {}", ready.encode());
    }
    Ok(ready.args.first().cloned().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_uses_byte_lengths() {
        let i = Instruction::new("select", vec!["rdp".to_string()]);
        assert_eq!(i.encode(), "6.select,3.rdp;");
        // multi-byte UTF-8 is measured in bytes, not chars
        let i = Instruction::new("name", vec!["终端".to_string()]);
        assert_eq!(i.encode(), "4.name,6.终端;");
    }

    #[test]
    fn parse_error_instruction() {
        let i = Instruction::parse("5.error,7.badauth,1.0;").expect("parse");
        assert_eq!(i.opcode, "error");
        assert_eq!(i.args, vec!["badauth".to_string(), "0".to_string()]);
    }

    #[test]
    fn parse_rejects_unterminated() {
        assert!(Instruction::parse("5.error,7.badauth").is_err());
        assert!(Instruction::parse("9.short;").is_err());
    }

    #[test]
    fn parser_handles_split_feeds() {
        let mut p = InstructionParser::new();
        p.feed(b"4.sync,8.12");
        assert!(p.next_raw().expect("partial").is_none());
        p.feed(b"345678;3.img");
        assert_eq!(p.next_raw().expect("complete"), Some("4.sync,8.12345678;".to_string()));
        assert!(p.next_raw().expect("tail partial").is_none());
        p.feed(b",1.5;");
        assert_eq!(p.next_raw().expect("second"), Some("3.img,1.5;".to_string()));
    }

    #[test]
    fn parser_yields_instructions_in_order() {
        let mut p = InstructionParser::new();
        p.feed(b"5.mouse,2.10,2.20;3.key,2.65;");
        assert_eq!(p.next_raw().unwrap(), Some("5.mouse,2.10,2.20;".to_string()));
        assert_eq!(p.next_raw().unwrap(), Some("3.key,2.65;".to_string()));
        assert_eq!(p.next_raw().unwrap(), None);
    }

    /// In-memory stream scripted with the bytes guacd would send.
    struct ScriptedStream {
        input: std::io::Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn rdp_params() -> GuacdParams {
        GuacdParams {
            protocol: "rdp".to_string(),
            hostname: "10.0.0.8".to_string(),
            port: "3389".to_string(),
            username: "administrator".to_string(),
            password: "secret".to_string(),
            width: "800".to_string(),
            height: "600".to_string(),
            dpi: "96".to_string(),
            extra: HashMap::from([
                ("ignore-cert".to_string(), "true".to_string()),
                ("security".to_string(), "any".to_string()),
            ]),
        }
    }

    #[test]
    fn handshake_answers_args_positionally() {
        let script = [
            Instruction::new(
                "args",
                ["VERSION_1_1_0", "hostname", "port", "password", "ignore-cert", "unknown-knob"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            )
            .encode(),
            Instruction::new("ready", vec!["$conn-42".to_string()]).encode(),
        ]
        .concat();
        let mut stream =
            ScriptedStream { input: std::io::Cursor::new(script.into_bytes()), written: Vec::new() };

        let id = handshake(&mut stream, &rdp_params()).expect("handshake");
        assert_eq!(id, "$conn-42");

        let sent = String::from_utf8(stream.written).expect("utf8");
        assert!(sent.starts_with("6.select,3.rdp;"));
        assert!(sent.contains("4.size,3.800,3.600,2.96;"));
        assert!(sent.contains("5.audio;5.video;5.image;"));
        // VERSION token echoed, unknown parameter answered with empty string
        assert!(sent.ends_with(
            "7.connect,13.VERSION_1_1_0,8.10.0.0.8,4.3389,6.secret,4.true,0.;"
        ));
    }

    #[test]
    fn handshake_fails_on_refusal() {
        let script = [
            Instruction::new("args", vec!["hostname".to_string()]).encode(),
            "5.error,11.unsupported;".to_string(),
        ]
        .concat();
        let mut stream =
            ScriptedStream { input: std::io::Cursor::new(script.into_bytes()), written: Vec::new() };
        assert!(handshake(&mut stream, &rdp_params()).is_err());
    }
}
