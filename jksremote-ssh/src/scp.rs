//! Minimal SCP sink client (`scp -t`) over an exec channel.
//!
//! Only the single-file upload direction is implemented.  Each protocol step
//! is acknowledged by the remote with a `\0` byte; `\x01` and `\x02` carry a
//! warning or fatal message terminated by `\n`.

use russh::client::Msg;
use russh::{Channel, ChannelMsg};

use jksremote_core::RemoteError;

/// File mode advertised in the `C` record.
const UPLOAD_MODE: &str = "0600";

pub(crate) async fn upload(
    mut channel: Channel<Msg>,
    remote_path: &str,
    file_name: &str,
    bytes: &[u8],
) -> Result<(), RemoteError> {
    let target = format!("{remote_path}{file_name}");
    let transfer = |reason: String| RemoteError::Transfer {
        path: target.clone(),
        reason,
    };

    channel
        .exec(true, format!("scp -t '{target}'"))
        .await
        .map_err(|e| transfer(e.to_string()))?;
    read_ack(&mut channel).await.map_err(transfer)?;

    let header = file_record(bytes.len(), file_name);
    channel
        .data(header.as_bytes())
        .await
        .map_err(|e| transfer(e.to_string()))?;
    read_ack(&mut channel).await.map_err(transfer)?;

    channel
        .data(bytes)
        .await
        .map_err(|e| transfer(e.to_string()))?;
    channel
        .data(&b"\0"[..])
        .await
        .map_err(|e| transfer(e.to_string()))?;
    read_ack(&mut channel).await.map_err(transfer)?;

    channel.eof().await.map_err(|e| transfer(e.to_string()))?;
    channel.close().await.map_err(|e| transfer(e.to_string()))?;
    Ok(())
}

fn file_record(len: usize, file_name: &str) -> String {
    format!("C{UPLOAD_MODE} {len} {file_name}\n")
}

async fn read_ack(channel: &mut Channel<Msg>) -> Result<(), String> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => return parse_ack(&data),
            Some(ChannelMsg::ExtendedData { data, .. }) => {
                tracing::debug!(stderr = %String::from_utf8_lossy(&data), "scp");
            }
            Some(ChannelMsg::ExitStatus { exit_status }) if exit_status != 0 => {
                return Err(format!("scp exited with status {exit_status}"));
            }
            Some(_) => {}
            None => return Err("channel closed before acknowledgement".to_string()),
        }
    }
}

fn parse_ack(data: &[u8]) -> Result<(), String> {
    match data.first() {
        Some(0) => Ok(()),
        Some(1) | Some(2) => Err(String::from_utf8_lossy(&data[1..]).trim().to_string()),
        Some(other) => Err(format!("unexpected scp response byte {other:#04x}")),
        None => Err("empty scp acknowledgement".to_string()),
    }
}
