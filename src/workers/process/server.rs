//! # Subprocess side of the process transport.
//!
//! [`WorkerServer`] is what a worker executable runs: read one [`Request`], run it through
//! its own [`CallRunner`], write one [`Response`], repeat until `Quit` or end of input.
//! Lazy sequences and results whose JSON text is oversized stay here, in a table keyed by
//! a hash-derived id, and are pulled one item at a time with `Next`. The loop side sends
//! `Release` for entries it abandons.
//!
//! ```rust,no_run
//! use workheap::{CallTable, Callable, Output, WorkerServer};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), workheap::WireError> {
//!     let table = CallTable::new().with(Callable::new("square", |a, _| {
//!         let x = a[0].as_i64().unwrap_or_default();
//!         Ok(Output::value(x * x))
//!     }));
//!     WorkerServer::new(table).serve_stdio().await
//! }
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::core::{panic_message, CallRunner, Config, Outcome};
use crate::error::WireError;
use crate::tasks::{Call, CallTable, ValueIter};
use crate::workers::process::wire::{read_frame, write_frame, Envelope, Request, Response};

/// Default serialized size above which results are sent in chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

enum Live {
    Sequence(ValueIter),
    Chunks(std::vec::IntoIter<String>),
}

/// Request loop run inside a worker process.
pub struct WorkerServer {
    table: CallTable,
    runner: CallRunner,
    live: HashMap<String, Live>,
    chunk_size: usize,
    counter: u64,
}

impl WorkerServer {
    /// Serves calls from `table`, timing each one.
    pub fn new(table: CallTable) -> Self {
        Self {
            table,
            runner: CallRunner::new().timed(true),
            live: HashMap::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            counter: 0,
        }
    }

    /// Results whose JSON text is longer than `bytes` are chunked. Zero disables chunking.
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Takes the chunk size from `cfg`.
    pub fn with_config(self, cfg: &Config) -> Self {
        self.with_chunk_size(cfg.chunk_size)
    }

    pub fn with_runner(mut self, runner: CallRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Live sequences and chunked values.
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Serves over this process's stdin and stdout.
    pub async fn serve_stdio(&mut self) -> Result<(), WireError> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serves until `Quit` or end of input.
    pub async fn serve<R, W>(&mut self, reader: R, mut writer: W) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        loop {
            let reply = match read_frame::<_, Envelope<Request>>(&mut reader).await {
                Ok(None)
                | Ok(Some(Envelope {
                    body: Request::Quit, ..
                })) => break,
                Ok(Some(Envelope { seq, body })) => Envelope::new(seq, self.handle(body)),
                Err(WireError::Codec(e)) => Envelope::new(
                    0,
                    Response::Error {
                        text: format!("bad request: {e}"),
                    },
                ),
                Err(e) => return Err(e),
            };
            write_frame(&mut writer, &reply).await?;
        }
        tracing::debug!(live = self.live.len(), "worker server loop ended");
        Ok(())
    }

    /// Answers one request. `Quit` is answered with `None`; the loop never sends it.
    pub fn handle(&mut self, req: Request) -> Response {
        match req {
            Request::Call {
                callable,
                args,
                kwargs,
            } => {
                let Some(func) = self.table.get(&callable) else {
                    return Response::Error {
                        text: format!("{callable}: no such callable"),
                    };
                };
                let call = Call::new(func.clone()).with_args(args).with_kwargs(kwargs);
                let outcome = self.runner.run(&call);
                self.respond(&callable, outcome)
            }
            Request::Next { id } => self.next(&id),
            Request::Release { id } => {
                if self.live.remove(&id).is_some() {
                    tracing::debug!(id, "released live entry");
                }
                Response::None
            }
            Request::Stats => Response::Stats {
                timings: self
                    .runner
                    .take_stats()
                    .iter()
                    .map(|d| d.as_secs_f64())
                    .collect(),
            },
            Request::Quit => Response::None,
        }
    }

    fn respond(&mut self, name: &str, outcome: Outcome) -> Response {
        match outcome {
            Outcome::Value(value) => match self.oversized(&value) {
                Some(text) => {
                    let id = self.next_id(name);
                    let chunks = split_chunks(&text, self.chunk_size);
                    self.live.insert(id.clone(), Live::Chunks(chunks.into_iter()));
                    Response::Chunked { id }
                }
                None => Response::Value { value },
            },
            Outcome::None => Response::None,
            Outcome::Error(text) => Response::Error { text },
            Outcome::Sequence(iter) => {
                let id = self.next_id(name);
                self.live.insert(id.clone(), Live::Sequence(iter));
                Response::Sequence { id }
            }
        }
    }

    /// The JSON text of `value`, if it is too long for one frame.
    fn oversized(&self, value: &Value) -> Option<String> {
        if self.chunk_size == 0 {
            return None;
        }
        serde_json::to_string(value)
            .ok()
            .filter(|text| text.len() > self.chunk_size)
    }

    fn next(&mut self, id: &str) -> Response {
        let item = match self.live.get_mut(id) {
            None => None,
            Some(Live::Chunks(chunks)) => chunks.next().map(Value::String),
            Some(Live::Sequence(iter)) => match catch_unwind(AssertUnwindSafe(|| iter.next())) {
                Ok(item) => item,
                Err(panic) => {
                    self.live.remove(id);
                    return Response::Error {
                        text: format!("iterator panicked: {}", panic_message(&*panic)),
                    };
                }
            },
        };
        match item {
            Some(value) => Response::Item { value, valid: true },
            None => {
                self.live.remove(id);
                Response::Item {
                    value: Value::Null,
                    valid: false,
                }
            }
        }
    }

    fn next_id(&mut self, name: &str) -> String {
        self.counter += 1;
        let mut h = DefaultHasher::new();
        self.counter.hash(&mut h);
        name.hash(&mut h);
        std::process::id().hash(&mut h);
        format!("{:016x}", h.finish())
    }
}

/// Splits `s` into pieces of at most `size` bytes, never inside a UTF-8 character.
fn split_chunks(s: &str, size: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s;
    while !rest.is_empty() {
        let mut end = size.min(rest.len());
        while end < rest.len() && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        out.push(head.to_string());
        rest = tail;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Callable, Output};
    use serde_json::json;

    fn server() -> WorkerServer {
        let table = CallTable::new()
            .with(Callable::new("gen", |_, _| {
                Ok(Output::sequence(vec![json!("a"), json!("b")]))
            }))
            .with(Callable::new("long", |_, _| Ok(Output::value("é".repeat(10)))))
            .with(Callable::new("list", |_, _| Ok(Output::value(json!([1, 2, 3, 4, 5])))))
            .with(Callable::new("tiny", |_, _| Ok(Output::value(json!([1])))));
        WorkerServer::new(table).with_chunk_size(5)
    }

    #[test]
    fn unknown_callable_is_an_error_reply() {
        let resp = server().handle(Request::Call {
            callable: "nope".into(),
            args: vec![],
            kwargs: Default::default(),
        });
        assert_eq!(
            resp,
            Response::Error {
                text: "nope: no such callable".into()
            }
        );
    }

    #[test]
    fn sequences_are_held_until_exhausted() {
        let mut s = server();
        let Response::Sequence { id } = s.handle(Request::Call {
            callable: "gen".into(),
            args: vec![],
            kwargs: Default::default(),
        }) else {
            panic!("expected a sequence id");
        };
        assert_eq!(s.live(), 1);
        let mut items = Vec::new();
        loop {
            match s.handle(Request::Next { id: id.clone() }) {
                Response::Item { value, valid: true } => items.push(value),
                Response::Item { valid: false, .. } => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(items, vec![json!("a"), json!("b")]);
        assert_eq!(s.live(), 0);
    }

    #[test]
    fn long_strings_are_chunked_on_char_boundaries() {
        let mut s = server();
        let resp = s.handle(Request::Call {
            callable: "long".into(),
            args: vec![],
            kwargs: Default::default(),
        });
        assert!(matches!(resp, Response::Chunked { .. }));
        let chunks = split_chunks(&"é".repeat(10), 5);
        assert!(chunks.iter().all(|c| c.len() <= 5));
        assert_eq!(chunks.concat(), "é".repeat(10));
    }

    fn call(s: &mut WorkerServer, name: &str) -> Response {
        s.handle(Request::Call {
            callable: name.into(),
            args: vec![],
            kwargs: Default::default(),
        })
    }

    #[test]
    fn large_values_of_any_shape_are_chunked() {
        let mut s = server();
        assert_eq!(call(&mut s, "tiny"), Response::Value { value: json!([1]) });

        let Response::Chunked { id } = call(&mut s, "list") else {
            panic!("expected a chunked reply");
        };
        let mut text = String::new();
        while let Response::Item {
            value: Value::String(piece),
            valid: true,
        } = s.handle(Request::Next { id: id.clone() })
        {
            assert!(piece.len() <= 5);
            text.push_str(&piece);
        }
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!([1, 2, 3, 4, 5]));
        assert_eq!(s.live(), 0);
    }

    #[test]
    fn released_sequences_are_dropped() {
        let mut s = server();
        let Response::Sequence { id } = call(&mut s, "gen") else {
            panic!("expected a sequence id");
        };
        assert!(matches!(
            s.handle(Request::Next { id: id.clone() }),
            Response::Item { valid: true, .. }
        ));
        assert_eq!(s.handle(Request::Release { id: id.clone() }), Response::None);
        assert_eq!(s.live(), 0);

        // Releasing twice, or fetching after release, is harmless.
        assert_eq!(s.handle(Request::Release { id: id.clone() }), Response::None);
        assert!(matches!(
            s.handle(Request::Next { id }),
            Response::Item { valid: false, .. }
        ));
    }

    #[tokio::test]
    async fn replies_echo_the_request_seq() {
        let tiny = Request::Call {
            callable: "tiny".into(),
            args: vec![],
            kwargs: Default::default(),
        };
        let mut input = Vec::new();
        for (seq, req) in [(4, tiny), (9, Request::Stats)] {
            input.extend(serde_json::to_vec(&Envelope::new(seq, req)).unwrap());
            input.push(b'\n');
        }
        input.extend(b"garbage\n");
        let mut output = Vec::new();
        server().serve(input.as_slice(), &mut output).await.unwrap();

        let seqs: Vec<u64> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<Envelope<Response>>(l).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![4, 9, 0]);
    }

    #[test]
    fn stats_drain_the_runner() {
        let mut s = server();
        s.handle(Request::Call {
            callable: "gen".into(),
            args: vec![],
            kwargs: Default::default(),
        });
        let Response::Stats { timings } = s.handle(Request::Stats) else {
            panic!("expected stats");
        };
        assert_eq!(timings.len(), 1);
        assert_eq!(s.handle(Request::Stats), Response::Stats { timings: vec![] });
    }
}
