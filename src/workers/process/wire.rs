//! Newline-delimited JSON frames between a [`ProcessWorker`](super::ProcessWorker) and its
//! [`WorkerServer`](super::WorkerServer).
//!
//! Every frame travels in an [`Envelope`] whose `seq` the server echoes back, so a reply
//! can be matched to its request. `seq` 0 marks a reply to nothing in particular, such as
//! a frame the server could not decode.
//!
//! ```text
//! → {"seq":1,"op":"call","callable":"square","args":[5],"kwargs":{}}
//! ← {"seq":1,"status":"value","value":25}
//! → {"seq":2,"op":"call","callable":"gen","args":[],"kwargs":{}}
//! ← {"seq":2,"status":"sequence","id":"9f2c..."}
//! → {"seq":3,"op":"next","id":"9f2c..."}
//! ← {"seq":3,"status":"item","value":1,"valid":true}
//! → {"seq":4,"op":"release","id":"9f2c..."}
//! ← {"seq":4,"status":"none"}
//! → {"seq":5,"op":"quit"}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::tasks::Kwargs;

/// Loop side → subprocess.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Run a callable registered under `callable`.
    Call {
        callable: String,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Kwargs,
    },
    /// Fetch the next item of a live sequence or the next chunk of a chunked value.
    Next { id: String },
    /// Drop a live sequence or chunked value the loop side no longer wants.
    Release { id: String },
    /// Return and clear the subprocess runner's timings.
    Stats,
    /// End the subprocess loop.
    Quit,
}

/// Subprocess → loop side.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Value { value: Value },
    None,
    Error { text: String },
    /// A sequence now lives in the subprocess under `id`.
    Sequence { id: String },
    /// A result whose JSON text is too long for one frame; fetch the pieces of that text
    /// with `Next { id }`.
    Chunked { id: String },
    /// One item of a sequence or chunked value; `valid == false` marks the end.
    Item {
        #[serde(default)]
        value: Value,
        valid: bool,
    },
    /// Call timings in seconds.
    Stats { timings: Vec<f64> },
}

/// A frame tagged with the sequence number of the request it belongs to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope<T> {
    #[serde(default)]
    pub seq: u64,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(seq: u64, body: T) -> Self {
        Self { seq, body }
    }
}

/// Writes one frame and flushes.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next non-empty frame, or `Ok(None)` at end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncBufRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn frames_are_tagged() {
        let req = Request::Next { id: "ab".into() };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"op": "next", "id": "ab"})
        );
        let resp = Response::Item {
            value: json!(3),
            valid: true,
        };
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"status": "item", "value": 3, "valid": true})
        );
    }

    #[test]
    fn envelopes_flatten_the_body() {
        let env = Envelope::new(7, Request::Release { id: "ab".into() });
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"seq": 7, "op": "release", "id": "ab"})
        );
        let back: Envelope<Response> = serde_json::from_str(r#"{"seq":7,"status":"none"}"#).unwrap();
        assert_eq!(back, Envelope::new(7, Response::None));

        // A frame without `seq` answers nothing in particular.
        let bare: Envelope<Request> = serde_json::from_str(r#"{"op":"stats"}"#).unwrap();
        assert_eq!(bare, Envelope::new(0, Request::Stats));
    }

    #[test]
    fn call_defaults_missing_arguments() {
        let req: Request = serde_json::from_str(r#"{"op":"call","callable":"f"}"#).unwrap();
        assert_eq!(
            req,
            Request::Call {
                callable: "f".into(),
                args: vec![],
                kwargs: Kwargs::new()
            }
        );
    }

    #[tokio::test]
    async fn skips_blank_lines_and_reports_eof() {
        let input = b"\n{\"op\":\"quit\"}\n\n" as &[u8];
        let mut reader = BufReader::new(input);
        let first: Option<Request> = read_frame(&mut reader).await.unwrap();
        assert_eq!(first, Some(Request::Quit));
        let second: Option<Request> = read_frame(&mut reader).await.unwrap();
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn garbage_is_a_codec_error() {
        let mut reader = BufReader::new(b"not json\n" as &[u8]);
        let err = read_frame::<_, Request>(&mut reader).await.unwrap_err();
        assert_eq!(err.as_label(), "wire_codec");
    }
}
