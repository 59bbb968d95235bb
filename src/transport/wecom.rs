//! WeCom callback decode/verify framing (§6 "WeCom callback framing").
//!
//! This is deliberately *not* a running transport: WeCom delivers
//! callbacks through a remote relay that this gateway does not host, so
//! there is no `run()` loop here, only the envelope decode pipeline a
//! relay-facing handler would call into. Grounded on the teacher's
//! `driver` module's preference for free functions over a hidden client
//! object wherever there is no long-lived connection to own.

use std::sync::OnceLock;

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use regex::Regex;
use sha1::{Digest, Sha1};

use crate::{AppError, Result};

type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// A callback envelope's declared type, per §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeType {
    /// URL-verification handshake.
    Verify,
    /// An inbound event/message callback.
    Callback,
    /// A direct API-shaped message (no signature framing).
    Message,
}

impl EnvelopeType {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "verify" => Ok(Self::Verify),
            "callback" => Ok(Self::Callback),
            "message" => Ok(Self::Message),
            other => Err(AppError::Transport(format!("unknown wecom envelope type: {other}"))),
        }
    }
}

/// The raw JSON envelope the relay forwards, before signature verification.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvelope {
    /// `"verify"`, `"callback"`, or `"message"`.
    #[serde(rename = "type")]
    pub envelope_type: String,
    /// Correlates the reply with the relay's request.
    pub request_id: String,
    /// Signature/timestamp/nonce, present on `verify` and `callback`.
    pub signature: Option<String>,
    /// Present on `verify` and `callback`.
    pub timestamp: Option<String>,
    /// Present on `verify` and `callback`.
    pub nonce: Option<String>,
    /// `echostr` on `verify`.
    pub echostr: Option<String>,
    /// The `<Encrypt>` CDATA contents on `callback`.
    pub ciphered: Option<String>,
}

/// Where the relay's verification handshake should be answered.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResult {
    #[serde(rename = "type")]
    kind: &'static str,
    request_id: String,
    echostr: Option<String>,
    error: Option<String>,
}

/// An inbound WeCom message decoded from a `callback` envelope (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeComMessage {
    /// `text`, `image`, etc. as reported by `MsgType`.
    pub msg_type: String,
    /// Message body, present for `text` messages.
    pub content: String,
    /// Sender's WeCom user id.
    pub from_user_name: String,
    /// Platform-assigned message id.
    pub msg_id: String,
    /// Group chat id, if this message came from a group.
    pub chat_id: Option<String>,
    /// Milliseconds since epoch, converted from `CreateTime` seconds.
    pub create_time_ms: i64,
}

impl WeComMessage {
    /// `group` iff `ChatId` is present, else `direct` (§6).
    #[must_use]
    pub fn chat_type(&self) -> &'static str {
        if self.chat_id.is_some() {
            "group"
        } else {
            "direct"
        }
    }
}

/// Verify `SHA1(sort(token, timestamp, nonce, ciphered))` against
/// `signature` (§6).
#[must_use]
pub fn verify_signature(token: &str, timestamp: &str, nonce: &str, ciphered: &str, signature: &str) -> bool {
    let mut parts = [token, timestamp, nonce, ciphered];
    parts.sort_unstable();

    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let computed = hex_encode(&digest);
    computed.eq_ignore_ascii_case(signature)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decrypt an AES-256-CBC `ciphered` blob using `encoding_aes_key`
/// (base64, 32 raw bytes once decoded). The IV is the key's first 16
/// bytes; the plaintext carries a big-endian 32-bit length at offset 16
/// bounding the XML payload that follows (§6).
///
/// # Errors
///
/// Returns `AppError::Transport` if the key/ciphertext cannot be decoded,
/// the block cipher rejects the padding, or the declared length exceeds
/// the decrypted buffer.
pub fn decrypt_callback(encoding_aes_key: &str, ciphered: &str) -> Result<Vec<u8>> {
    let key = BASE64
        .decode(encoding_aes_key)
        .map_err(|e| AppError::Transport(format!("invalid encoding_aes_key: {e}")))?;
    if key.len() != 32 {
        return Err(AppError::Transport(format!(
            "encoding_aes_key decoded to {} bytes, expected 32",
            key.len()
        )));
    }
    let iv = &key[..16];

    let mut buf = BASE64
        .decode(ciphered)
        .map_err(|e| AppError::Transport(format!("invalid ciphered payload: {e}")))?;

    let decryptor = Aes256CbcDec::new_from_slices(&key, iv)
        .map_err(|e| AppError::Transport(format!("aes key/iv setup failed: {e}")))?;
    let plaintext = decryptor
        .decrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf)
        .map_err(|e| AppError::Transport(format!("aes-cbc decrypt failed: {e}")))?;

    if plaintext.len() < 20 {
        return Err(AppError::Transport("decrypted callback shorter than header".into()));
    }
    let declared_len = u32::from_be_bytes([plaintext[16], plaintext[17], plaintext[18], plaintext[19]]) as usize;
    let xml_start: usize = 20;
    let xml_end = xml_start
        .checked_add(declared_len)
        .filter(|&end| end <= plaintext.len())
        .ok_or_else(|| {
            AppError::Transport("callback XML length exceeds decrypted buffer".into())
        })?;

    Ok(plaintext[xml_start..xml_end].to_vec())
}

fn tag_regex(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{tag}>(?:<!\[CDATA\[(.*?)\]\]>|([^<]*))</{tag}>")).unwrap_or_else(|e| {
        unreachable!("static wecom tag pattern for <{tag}> must compile: {e}")
    })
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    static CACHE: OnceLock<std::sync::Mutex<std::collections::HashMap<String, Regex>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| std::sync::Mutex::new(std::collections::HashMap::new()));
    let mut guard = cache.lock().ok()?;
    let re = guard.entry(tag.to_owned()).or_insert_with(|| tag_regex(tag));
    let caps = re.captures(xml)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_owned())
}

/// Parse the decrypted callback XML into a [`WeComMessage`] (§6).
///
/// # Errors
///
/// Returns `AppError::Transport` if a required field (`MsgType`,
/// `FromUserName`, `MsgId`, `CreateTime`) is missing or malformed.
pub fn parse_callback_xml(xml: &str) -> Result<WeComMessage> {
    let msg_type = extract_tag(xml, "MsgType")
        .ok_or_else(|| AppError::Transport("callback XML missing MsgType".into()))?;
    let from_user_name = extract_tag(xml, "FromUserName")
        .ok_or_else(|| AppError::Transport("callback XML missing FromUserName".into()))?;
    let msg_id = extract_tag(xml, "MsgId")
        .ok_or_else(|| AppError::Transport("callback XML missing MsgId".into()))?;
    let create_time_raw = extract_tag(xml, "CreateTime")
        .ok_or_else(|| AppError::Transport("callback XML missing CreateTime".into()))?;
    let create_time_s: i64 = create_time_raw
        .parse()
        .map_err(|_| AppError::Transport(format!("malformed CreateTime: {create_time_raw}")))?;

    Ok(WeComMessage {
        msg_type,
        content: extract_tag(xml, "Content").unwrap_or_default(),
        from_user_name,
        msg_id,
        chat_id: extract_tag(xml, "ChatId"),
        create_time_ms: create_time_s * 1000,
    })
}

/// Handle a `verify` envelope: check the signature, decrypt `echostr`,
/// and return the relay-facing result (§6).
#[must_use]
pub fn handle_verify(token: &str, encoding_aes_key: &str, envelope: &RawEnvelope) -> VerifyResult {
    let (Some(signature), Some(timestamp), Some(nonce), Some(echostr)) = (
        envelope.signature.as_deref(),
        envelope.timestamp.as_deref(),
        envelope.nonce.as_deref(),
        envelope.echostr.as_deref(),
    ) else {
        return VerifyResult {
            kind: "verifyResult",
            request_id: envelope.request_id.clone(),
            echostr: None,
            error: Some("verify envelope missing required fields".into()),
        };
    };

    if !verify_signature(token, timestamp, nonce, echostr, signature) {
        return VerifyResult {
            kind: "verifyResult",
            request_id: envelope.request_id.clone(),
            echostr: None,
            error: Some("signature mismatch".into()),
        };
    }

    match decrypt_callback(encoding_aes_key, echostr) {
        Ok(plain) => VerifyResult {
            kind: "verifyResult",
            request_id: envelope.request_id.clone(),
            echostr: Some(String::from_utf8_lossy(&plain).into_owned()),
            error: None,
        },
        Err(err) => VerifyResult {
            kind: "verifyResult",
            request_id: envelope.request_id.clone(),
            echostr: None,
            error: Some(err.to_string()),
        },
    }
}

/// Decode a `callback` envelope into a [`WeComMessage`], verifying the
/// signature first (§6, §7 "callback drop" on decryption failure).
///
/// # Errors
///
/// Returns `AppError::Transport` if required fields are missing, the
/// signature fails verification, decryption fails, or the XML cannot be
/// parsed.
pub fn decode_callback(token: &str, encoding_aes_key: &str, envelope: &RawEnvelope) -> Result<WeComMessage> {
    let _ = EnvelopeType::parse(&envelope.envelope_type)?;
    let (Some(signature), Some(timestamp), Some(nonce), Some(ciphered)) = (
        envelope.signature.as_deref(),
        envelope.timestamp.as_deref(),
        envelope.nonce.as_deref(),
        envelope.ciphered.as_deref(),
    ) else {
        return Err(AppError::Transport("callback envelope missing required fields".into()));
    };

    if !verify_signature(token, timestamp, nonce, ciphered, signature) {
        return Err(AppError::Transport("callback signature mismatch".into()));
    }

    let plain = decrypt_callback(encoding_aes_key, ciphered)?;
    let xml = String::from_utf8(plain).map_err(|e| AppError::Transport(format!("callback XML not UTF-8: {e}")))?;
    parse_callback_xml(&xml)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> String {
        BASE64.encode([7u8; 32])
    }

    #[test]
    fn verify_signature_matches_sorted_sha1() {
        let token = "token123";
        let timestamp = "1700000000";
        let nonce = "nonce1";
        let ciphered = "ciphertext";

        let mut parts = [token, timestamp, nonce, ciphered];
        parts.sort_unstable();
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        let expected = hex_encode(&hasher.finalize());

        assert!(verify_signature(token, timestamp, nonce, ciphered, &expected));
        assert!(!verify_signature(token, timestamp, nonce, ciphered, "deadbeef"));
    }

    #[test]
    fn decrypt_callback_roundtrips_aes_256_cbc_with_length_header() {
        use aes::cipher::block_padding::Pkcs7;
        use aes::cipher::BlockEncryptMut;

        let key = [7u8; 32];
        let iv = &key[..16];
        let xml = b"<xml><MsgType>text</MsgType></xml>";
        let mut plaintext = Vec::new();
        plaintext.extend_from_slice(&[0u8; 16]);
        plaintext.extend_from_slice(&(xml.len() as u32).to_be_bytes());
        plaintext.extend_from_slice(xml);

        let mut buf = plaintext.clone();
        buf.resize(plaintext.len() + 16, 0);
        let encryptor = cbc::Encryptor::<Aes256>::new_from_slices(&key, iv).expect("encryptor");
        let ciphertext = encryptor
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .expect("encrypt");
        let ciphered_b64 = BASE64.encode(ciphertext);

        let decoded = decrypt_callback(&BASE64.encode(key), &ciphered_b64).expect("decrypt");
        assert_eq!(decoded, xml);
    }

    #[test]
    fn decrypt_callback_rejects_declared_length_exceeding_buffer() {
        use aes::cipher::block_padding::Pkcs7;
        use aes::cipher::BlockEncryptMut;

        let key = [7u8; 32];
        let iv = &key[..16];
        let xml = b"<xml><MsgType>text</MsgType></xml>";
        let mut plaintext = Vec::new();
        plaintext.extend_from_slice(&[0u8; 16]);
        // Declare a length far larger than the XML that actually follows.
        plaintext.extend_from_slice(&(xml.len() as u32 + 1000).to_be_bytes());
        plaintext.extend_from_slice(xml);

        let mut buf = plaintext.clone();
        buf.resize(plaintext.len() + 16, 0);
        let encryptor = cbc::Encryptor::<Aes256>::new_from_slices(&key, iv).expect("encryptor");
        let ciphertext = encryptor
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .expect("encrypt");
        let ciphered_b64 = BASE64.encode(ciphertext);

        let err = decrypt_callback(&BASE64.encode(key), &ciphered_b64).expect_err("must fail");
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn parse_callback_xml_extracts_fields_and_classifies_group_chat() {
        let xml = "<xml><MsgType>text</MsgType><Content>hi</Content>\
                    <FromUserName>u1</FromUserName><MsgId>m1</MsgId>\
                    <ChatId>c1</ChatId><CreateTime>1700000000</CreateTime></xml>";
        let msg = parse_callback_xml(xml).expect("parse");
        assert_eq!(msg.msg_type, "text");
        assert_eq!(msg.content, "hi");
        assert_eq!(msg.chat_id.as_deref(), Some("c1"));
        assert_eq!(msg.chat_type(), "group");
        assert_eq!(msg.create_time_ms, 1_700_000_000_000);
    }

    #[test]
    fn parse_callback_xml_classifies_direct_chat_without_chat_id() {
        let xml = "<xml><MsgType>text</MsgType><Content>hi</Content>\
                    <FromUserName>u1</FromUserName><MsgId>m1</MsgId>\
                    <CreateTime>1700000000</CreateTime></xml>";
        let msg = parse_callback_xml(xml).expect("parse");
        assert!(msg.chat_id.is_none());
        assert_eq!(msg.chat_type(), "direct");
    }

    #[test]
    fn decode_callback_rejects_bad_signature() {
        let envelope = RawEnvelope {
            envelope_type: "callback".into(),
            request_id: "req-1".into(),
            signature: Some("deadbeef".into()),
            timestamp: Some("1700000000".into()),
            nonce: Some("nonce1".into()),
            echostr: None,
            ciphered: Some("doesnotmatter".into()),
        };
        let err = decode_callback("token123", &sample_key(), &envelope).expect_err("must fail");
        assert!(err.to_string().contains("signature"));
    }
}
