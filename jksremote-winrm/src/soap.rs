//! WS-Management SOAP envelopes for the Windows remote shell, and parsers for
//! the responses the transport cares about.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

const NS: &str = concat!(
    r#"xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
    r#"xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
    r#"xmlns:p="http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd" "#,
    r#"xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell""#
);

pub const RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const STATE_DONE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

/// WS-Man fault code for an operation timeout on Receive; the command is
/// still running and the caller should poll again.
pub const TIMED_OUT_FAULT_CODE: &str = "2150858793";

const MAX_ENVELOPE_SIZE: u32 = 153_600;
const OPERATION_TIMEOUT: &str = "PT60S";

/// Per-request header fields.
struct Header<'a> {
    endpoint: &'a str,
    action: &'a str,
    shell_id: Option<&'a str>,
    options: &'a [(&'a str, &'a str)],
}

fn header(h: &Header<'_>) -> String {
    let message_id = uuid::Uuid::new_v4();
    let selector = h
        .shell_id
        .map(|id| {
            format!(r#"<w:SelectorSet><w:Selector Name="ShellId">{id}</w:Selector></w:SelectorSet>"#)
        })
        .unwrap_or_default();
    let options = if h.options.is_empty() {
        String::new()
    } else {
        let items: String = h
            .options
            .iter()
            .map(|(name, value)| format!(r#"<w:Option Name="{name}">{value}</w:Option>"#))
            .collect();
        format!("<w:OptionSet>{items}</w:OptionSet>")
    };
    format!(
        concat!(
            "<s:Header>",
            "<a:To>{endpoint}</a:To>",
            r#"<w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>"#,
            "<a:ReplyTo><a:Address s:mustUnderstand=\"true\">",
            "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous",
            "</a:Address></a:ReplyTo>",
            r#"<a:Action s:mustUnderstand="true">{action}</a:Action>"#,
            r#"<w:MaxEnvelopeSize s:mustUnderstand="true">{max}</w:MaxEnvelopeSize>"#,
            "<a:MessageID>uuid:{message_id}</a:MessageID>",
            r#"<w:Locale xml:lang="en-US" s:mustUnderstand="false"/>"#,
            "<w:OperationTimeout>{timeout}</w:OperationTimeout>",
            "{selector}{options}",
            "</s:Header>"
        ),
        endpoint = escape(h.endpoint),
        resource = RESOURCE_URI,
        action = h.action,
        max = MAX_ENVELOPE_SIZE,
        message_id = message_id,
        timeout = OPERATION_TIMEOUT,
        selector = selector,
        options = options,
    )
}

fn envelope(h: &Header<'_>, body: &str) -> String {
    format!(
        r#"<s:Envelope {NS}>{}<s:Body>{body}</s:Body></s:Envelope>"#,
        header(h)
    )
}

pub fn create_shell(endpoint: &str) -> String {
    envelope(
        &Header {
            endpoint,
            action: ACTION_CREATE,
            shell_id: None,
            options: &[("WINRS_NOPROFILE", "FALSE"), ("WINRS_CODEPAGE", "65001")],
        },
        concat!(
            "<rsp:Shell>",
            "<rsp:InputStreams>stdin</rsp:InputStreams>",
            "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
            "</rsp:Shell>"
        ),
    )
}

pub fn delete_shell(endpoint: &str, shell_id: &str) -> String {
    envelope(
        &Header {
            endpoint,
            action: ACTION_DELETE,
            shell_id: Some(shell_id),
            options: &[],
        },
        "",
    )
}

pub fn command(endpoint: &str, shell_id: &str, program: &str, arguments: &str) -> String {
    envelope(
        &Header {
            endpoint,
            action: ACTION_COMMAND,
            shell_id: Some(shell_id),
            options: &[
                ("WINRS_CONSOLEMODE_STDIN", "TRUE"),
                ("WINRS_SKIP_CMD_SHELL", "FALSE"),
            ],
        },
        &format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command><rsp:Arguments>{}</rsp:Arguments></rsp:CommandLine>",
            escape(program),
            escape(arguments)
        ),
    )
}

/// One stdin chunk.  `end` closes the stream.
pub fn send(endpoint: &str, shell_id: &str, command_id: &str, chunk: &[u8], end: bool) -> String {
    let end_attr = if end { r#" End="true""# } else { "" };
    envelope(
        &Header {
            endpoint,
            action: ACTION_SEND,
            shell_id: Some(shell_id),
            options: &[],
        },
        &format!(
            r#"<rsp:Send><rsp:Stream Name="stdin" CommandId="{command_id}"{end_attr}>{}</rsp:Stream></rsp:Send>"#,
            B64.encode(chunk)
        ),
    )
}

pub fn receive(endpoint: &str, shell_id: &str, command_id: &str) -> String {
    envelope(
        &Header {
            endpoint,
            action: ACTION_RECEIVE,
            shell_id: Some(shell_id),
            options: &[],
        },
        &format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{command_id}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#
        ),
    )
}

pub fn signal_terminate(endpoint: &str, shell_id: &str, command_id: &str) -> String {
    envelope(
        &Header {
            endpoint,
            action: ACTION_SIGNAL,
            shell_id: Some(shell_id),
            options: &[],
        },
        &format!(
            r#"<rsp:Signal CommandId="{command_id}"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"#
        ),
    )
}

fn escape(value: &str) -> std::borrow::Cow<'_, str> {
    quick_xml::escape::escape(value)
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed response: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed stream payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("response has no {0} element")]
    Missing(&'static str),
    #[error("{0}")]
    Fault(String),
}

/// Output collected from one Receive response.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReceiveChunk {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub done: bool,
    pub exit_code: Option<i32>,
}

/// Text content of the first element with local name `name`.
fn first_text(xml: &str, name: &[u8]) -> Result<Option<String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut inside = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == name => inside = true,
            Event::Text(t) if inside => return Ok(Some(t.unescape()?.into_owned())),
            Event::End(e) if inside && e.local_name().as_ref() == name => return Ok(None),
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Result<Option<String>, ParseError> {
    for attr in e.attributes().flatten() {
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

/// Surface a SOAP fault as an error carrying its reason text.
pub fn check_fault(xml: &str) -> Result<(), ParseError> {
    if has_element(xml, b"Fault")? {
        let reason = first_text(xml, b"Message")?
            .or(first_text(xml, b"Text")?)
            .unwrap_or_else(|| "unknown fault".to_string());
        let code = fault_code(xml)?;
        return Err(ParseError::Fault(match code {
            Some(code) => format!("{reason} (code {code})"),
            None => reason,
        }));
    }
    Ok(())
}

fn has_element(xml: &str, name: &[u8]) -> Result<bool, ParseError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == name => {
                return Ok(true);
            }
            Event::Eof => return Ok(false),
            _ => {}
        }
    }
}

fn fault_code(xml: &str) -> Result<Option<String>, ParseError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"WSManFault" => {
                return attribute(&e, b"Code");
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

pub fn parse_shell_id(xml: &str) -> Result<String, ParseError> {
    check_fault(xml)?;
    first_text(xml, b"ShellId")?.ok_or(ParseError::Missing("ShellId"))
}

pub fn parse_command_id(xml: &str) -> Result<String, ParseError> {
    check_fault(xml)?;
    first_text(xml, b"CommandId")?.ok_or(ParseError::Missing("CommandId"))
}

pub fn parse_receive(xml: &str) -> Result<ReceiveChunk, ParseError> {
    check_fault(xml)?;
    let mut chunk = ReceiveChunk::default();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stream: Option<String> = None;
    let mut in_exit_code = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"Stream" => stream = attribute(&e, b"Name")?,
                b"CommandState" => {
                    if attribute(&e, b"State")?.as_deref() == Some(STATE_DONE) {
                        chunk.done = true;
                    }
                }
                b"ExitCode" => in_exit_code = true,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"CommandState" => {
                if attribute(&e, b"State")?.as_deref() == Some(STATE_DONE) {
                    chunk.done = true;
                }
            }
            Event::Text(t) => {
                let text = t.unescape()?;
                if in_exit_code {
                    chunk.exit_code = text.trim().parse().ok();
                } else if let Some(name) = stream.as_deref() {
                    let bytes = B64.decode(text.trim())?;
                    match name {
                        "stdout" => chunk.stdout.extend_from_slice(&bytes),
                        "stderr" => chunk.stderr.extend_from_slice(&bytes),
                        _ => {}
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"Stream" => stream = None,
                b"ExitCode" => in_exit_code = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(chunk)
}

const CLIXML_MARKER: &str = "#< CLIXML";

/// Split PowerShell's error stream into individual records.
///
/// PowerShell serialises errors as CLIXML (`<S S="Error">` elements with
/// `_xHHHH_` escapes) when its host output is redirected; plain text is
/// handled too.  Each non-blank line becomes one record.
pub fn error_records(stderr: &str) -> Result<Vec<String>, ParseError> {
    let text = match stderr.trim_start().strip_prefix(CLIXML_MARKER) {
        Some(xml) => clixml_errors(xml)?,
        None => stderr.to_string(),
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn clixml_errors(xml: &str) -> Result<String, ParseError> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_error = false;
    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"S" => {
                in_error = attribute(&e, b"S")?.as_deref() == Some("Error");
            }
            Event::Text(t) if in_error => out.push_str(&decode_clixml_escapes(&t.unescape()?)),
            Event::End(e) if e.local_name().as_ref() == b"S" => in_error = false,
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

/// Decode `_xHHHH_` escapes (UTF-16 code units) used in CLIXML strings.
pub fn decode_clixml_escapes(value: &str) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(value.len());
    let mut rest = value;
    while !rest.is_empty() {
        if let Some(code) = rest
            .strip_prefix("_x")
            .filter(|r| r.len() >= 5 && r.as_bytes()[4] == b'_')
            .and_then(|r| u16::from_str_radix(&r[..4], 16).ok())
        {
            units.push(code);
            rest = &rest[7..];
            continue;
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            let mut buf = [0u16; 2];
            units.extend_from_slice(c.encode_utf16(&mut buf));
        }
        rest = chars.as_str();
    }
    String::from_utf16_lossy(&units)
}
