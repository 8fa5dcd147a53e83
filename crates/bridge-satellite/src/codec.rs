use bridge_protocol::CodecError;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Space-delimited text-line wire frames sent to the satellite device
/// (`spec.md` §4.5's direction table, `out`).
#[derive(Debug, Clone, PartialEq)]
pub enum OutCommand {
    Begin {
        device_id: String,
        product_name: String,
        keys_per_row: u32,
        keys_total: u32,
        bitmap_size: u32,
    },
    KeyPress {
        device_id: String,
        key_index: u32,
        pressed: bool,
    },
    KeyRotate {
        device_id: String,
        key_index: u32,
        direction: i8,
    },
    KeysClear {
        device_id: String,
    },
    VariableValue {
        name: String,
        value: String,
    },
    Ping,
}

/// A single `KEY-STATE` value tag (`spec.md` §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStateTag {
    Color(String),
    Text(String),
    Bitmap(String),
    Pressed,
    Released,
}

/// Wire frames received from the satellite device
/// (`spec.md` §4.5's direction table, `in`).
#[derive(Debug, Clone, PartialEq)]
pub enum InCommand {
    AddDevice {
        device_id: String,
        capabilities: Vec<String>,
    },
    KeyState {
        device_id: String,
        key_index: u32,
        tags: Vec<KeyStateTag>,
    },
    VariablesUpdate {
        updates: Vec<(String, String)>,
    },
    Brightness {
        device_id: String,
        level: u32,
    },
    Pong,
    Error {
        message: String,
    },
}

fn invalid(field: &str, reason: impl Into<String>) -> CodecError {
    CodecError::Invalid { field: field.to_owned(), reason: reason.into() }
}

const ARG_SET: &AsciiSet = NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

fn percent_encode_arg(s: &str) -> String {
    utf8_percent_encode(s, ARG_SET).to_string()
}

fn percent_decode_arg(s: &str) -> Result<String, CodecError> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|e| invalid("percent-encoding", e.to_string()))
}

/// Render an [`OutCommand`] as the exact line sent over the socket, with no
/// trailing newline (`spec.md` §4.5).
#[must_use]
pub fn encode_out(cmd: &OutCommand) -> String {
    match cmd {
        OutCommand::Begin { device_id, product_name, keys_per_row, keys_total, bitmap_size } => {
            format!(
                "BEGIN {device_id} {} {keys_per_row} {keys_total} {bitmap_size}",
                percent_encode_arg(product_name)
            )
        }
        OutCommand::KeyPress { device_id, key_index, pressed } => {
            let state = if *pressed { "PRESSED" } else { "RELEASED" };
            format!("KEY-PRESS {device_id} {key_index} {state}")
        }
        OutCommand::KeyRotate { device_id, key_index, direction } => {
            format!("KEY-ROTATE {device_id} {key_index} {direction}")
        }
        OutCommand::KeysClear { device_id } => format!("KEYS-CLEAR {device_id}"),
        OutCommand::VariableValue { name, value } => {
            format!("VARIABLE-VALUE {name}={}", percent_encode_arg(value))
        }
        OutCommand::Ping => "PING".to_owned(),
    }
}

fn next_token<'a>(parts: &mut impl Iterator<Item = &'a str>, field: &str) -> Result<String, CodecError> {
    parts.next().map(str::to_owned).ok_or_else(|| invalid(field, "missing argument"))
}

fn next_u32<'a>(parts: &mut impl Iterator<Item = &'a str>, field: &str) -> Result<u32, CodecError> {
    next_token(parts, field)?.parse().map_err(|_| invalid(field, "expected an integer"))
}

fn parse_key_state_tag(token: &str) -> Result<KeyStateTag, CodecError> {
    if let Some(hex) = token.strip_prefix("COLOR:") {
        return Ok(KeyStateTag::Color(hex.to_owned()));
    }
    if let Some(enc) = token.strip_prefix("TEXT:") {
        return Ok(KeyStateTag::Text(percent_decode_arg(enc)?));
    }
    if let Some(b64) = token.strip_prefix("BITMAP:") {
        return Ok(KeyStateTag::Bitmap(b64.to_owned()));
    }
    match token {
        "PRESSED" => Ok(KeyStateTag::Pressed),
        "RELEASED" => Ok(KeyStateTag::Released),
        other => Err(invalid("tag", format!("unrecognized KEY-STATE tag '{other}'"))),
    }
}

fn parse_name_value(token: &str) -> Result<(String, String), CodecError> {
    let (name, value) = token
        .split_once('=')
        .ok_or_else(|| invalid("name=value", format!("malformed token '{token}'")))?;
    Ok((name.to_owned(), percent_decode_arg(value)?))
}

/// Parse one received line into an [`InCommand`] (`spec.md` §4.5).
pub fn decode_in(line: &str) -> Result<InCommand, CodecError> {
    let mut parts = line.trim_end_matches(['\r', '\n']).split(' ').filter(|s| !s.is_empty());
    let command = parts.next().ok_or_else(|| invalid("command", "empty line"))?;

    match command {
        "ADD-DEVICE" => {
            let device_id = next_token(&mut parts, "deviceId")?;
            let capabilities = parts.map(str::to_owned).collect();
            Ok(InCommand::AddDevice { device_id, capabilities })
        }
        "KEY-STATE" => {
            let device_id = next_token(&mut parts, "deviceId")?;
            let key_index = next_u32(&mut parts, "keyIndex")?;
            let tags = parts.map(parse_key_state_tag).collect::<Result<Vec<_>, _>>()?;
            Ok(InCommand::KeyState { device_id, key_index, tags })
        }
        "VARIABLES-UPDATE" => {
            let updates = parts.map(parse_name_value).collect::<Result<Vec<_>, _>>()?;
            if updates.is_empty() {
                return Err(invalid("updates", "VARIABLES-UPDATE requires at least one name=value token"));
            }
            Ok(InCommand::VariablesUpdate { updates })
        }
        "BRIGHTNESS" => {
            let device_id = next_token(&mut parts, "deviceId")?;
            let level = next_u32(&mut parts, "level")?;
            Ok(InCommand::Brightness { device_id, level })
        }
        "PONG" => Ok(InCommand::Pong),
        "ERROR" => {
            let message = parts.collect::<Vec<_>>().join(" ");
            Ok(InCommand::Error { message })
        }
        other => Err(invalid("command", format!("unknown inbound command '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_begin_with_percent_encoded_product_name() {
        let line = encode_out(&OutCommand::Begin {
            device_id: "dev1".to_owned(),
            product_name: "Stream Dock XL".to_owned(),
            keys_per_row: 8,
            keys_total: 32,
            bitmap_size: 96,
        });
        assert_eq!(line, "BEGIN dev1 Stream%20Dock%20XL 8 32 96");
    }

    #[test]
    fn encodes_key_press_and_release() {
        assert_eq!(
            encode_out(&OutCommand::KeyPress { device_id: "dev1".to_owned(), key_index: 3, pressed: true }),
            "KEY-PRESS dev1 3 PRESSED"
        );
        assert_eq!(
            encode_out(&OutCommand::KeyPress { device_id: "dev1".to_owned(), key_index: 3, pressed: false }),
            "KEY-PRESS dev1 3 RELEASED"
        );
    }

    #[test]
    fn encodes_variable_value_with_percent_encoded_value() {
        let line = encode_out(&OutCommand::VariableValue {
            name: "lap_time".to_owned(),
            value: "1:23.4 (PB)".to_owned(),
        });
        assert_eq!(line, "VARIABLE-VALUE lap_time=1%3A23.4%20%28PB%29");
    }

    #[test]
    fn decodes_add_device_with_capability_tokens() {
        let cmd = decode_in("ADD-DEVICE dev1 API:1.0 ROTATION VARIABLE_WRITE").unwrap();
        assert_eq!(
            cmd,
            InCommand::AddDevice {
                device_id: "dev1".to_owned(),
                capabilities: vec!["API:1.0".to_owned(), "ROTATION".to_owned(), "VARIABLE_WRITE".to_owned()],
            }
        );
    }

    #[test]
    fn decodes_key_state_with_mixed_tags() {
        let cmd = decode_in("KEY-STATE dev1 5 COLOR:ff0000 TEXT:Go%21 PRESSED").unwrap();
        assert_eq!(
            cmd,
            InCommand::KeyState {
                device_id: "dev1".to_owned(),
                key_index: 5,
                tags: vec![
                    KeyStateTag::Color("ff0000".to_owned()),
                    KeyStateTag::Text("Go!".to_owned()),
                    KeyStateTag::Pressed,
                ],
            }
        );
    }

    #[test]
    fn decodes_variables_update_with_percent_decoded_values() {
        let cmd = decode_in("VARIABLES-UPDATE lap=1%3A02.5 pos=3rd").unwrap();
        assert_eq!(
            cmd,
            InCommand::VariablesUpdate {
                updates: vec![("lap".to_owned(), "1:02.5".to_owned()), ("pos".to_owned(), "3rd".to_owned())],
            }
        );
    }

    #[test]
    fn variables_update_with_no_tokens_is_rejected() {
        assert!(decode_in("VARIABLES-UPDATE").is_err());
    }

    #[test]
    fn decodes_error_with_joined_message() {
        let cmd = decode_in("ERROR device offline unexpectedly").unwrap();
        assert_eq!(cmd, InCommand::Error { message: "device offline unexpectedly".to_owned() });
    }

    #[test]
    fn unknown_inbound_command_is_rejected() {
        assert!(decode_in("FROBNICATE dev1").is_err());
    }

    #[test]
    fn unrecognized_key_state_tag_is_rejected() {
        assert!(decode_in("KEY-STATE dev1 0 SPARKLE").is_err());
    }
}
