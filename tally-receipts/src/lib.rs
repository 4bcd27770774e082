use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("chain broken at line {line}: {reason}")]
    Chain { line: usize, reason: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Answered,
    ValidationFailed,
    Error,
}

/// One served turn. `prev_hash` and `chain_hash` are filled in by [`ReceiptLog::append`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnReceipt {
    pub receipt_id: Uuid,
    pub timestamp: String,
    pub turn_id: Uuid,
    pub session_id: Option<String>,
    pub outcome: TurnOutcome,
    pub confidence: Option<String>,
    pub input_hash: String,
    pub output_hash: String,
    pub prev_hash: Option<String>,
    pub chain_hash: String,
}

impl TurnReceipt {
    pub fn new(
        timestamp: impl Into<String>,
        turn_id: Uuid,
        session_id: Option<String>,
        outcome: TurnOutcome,
        confidence: Option<String>,
        input: &impl Serialize,
        output: &impl Serialize,
    ) -> Self {
        Self {
            receipt_id: Uuid::new_v4(),
            timestamp: timestamp.into(),
            turn_id,
            session_id,
            outcome,
            confidence,
            input_hash: hash_json(input),
            output_hash: hash_json(output),
            prev_hash: None,
            chain_hash: String::new(),
        }
    }
}

/// sha256 of the compact JSON encoding. Unserializable values hash as `null`.
pub fn hash_json(value: &impl Serialize) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
    format!("{:x}", Sha256::digest(&bytes))
}

/// Append-only JSONL log. The file handle stays open and appends are serialized.
pub struct ReceiptLog {
    path: PathBuf,
    head: Mutex<Head>,
}

struct Head {
    file: File,
    chain_hash: Option<String>,
}

impl ReceiptLog {
    /// Opens or creates the log, picking up the chain where it left off.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReceiptError> {
        let path = path.as_ref().to_path_buf();
        let chain_hash = read_all(&path)?.pop().map(|r| r.chain_hash);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ReceiptError::Io(format!("{}: {e}", path.display())))?;
        Ok(Self {
            path,
            head: Mutex::new(Head { file, chain_hash }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Links `receipt` to the current head, writes it as one line and returns it sealed.
    pub fn append(&self, receipt: TurnReceipt) -> Result<TurnReceipt, ReceiptError> {
        let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);
        let sealed = seal(receipt, head.chain_hash.clone());
        let mut line = serde_json::to_vec(&sealed).map_err(|e| ReceiptError::Parse(e.to_string()))?;
        line.push(b'\n');
        head.file
            .write_all(&line)
            .and_then(|()| head.file.flush())
            .map_err(|e| ReceiptError::Io(e.to_string()))?;
        head.chain_hash = Some(sealed.chain_hash.clone());
        Ok(sealed)
    }
}

fn seal(mut receipt: TurnReceipt, prev_hash: Option<String>) -> TurnReceipt {
    receipt.prev_hash = prev_hash;
    receipt.chain_hash = chain_hash(&receipt);
    receipt
}

/// sha256 over the receipt's JSON with `chain_hash` left empty.
fn chain_hash(receipt: &TurnReceipt) -> String {
    let unsealed = TurnReceipt {
        chain_hash: String::new(),
        ..receipt.clone()
    };
    hash_json(&unsealed)
}

/// Walks the log and checks every link. Returns the number of receipts.
pub fn verify_log(path: impl AsRef<Path>) -> Result<usize, ReceiptError> {
    let receipts = read_all(path.as_ref())?;
    let mut prev: Option<String> = None;
    for (i, receipt) in receipts.iter().enumerate() {
        if receipt.prev_hash != prev {
            return Err(ReceiptError::Chain {
                line: i + 1,
                reason: "hash chain mismatch".into(),
            });
        }
        if receipt.chain_hash != chain_hash(receipt) {
            return Err(ReceiptError::Chain {
                line: i + 1,
                reason: "chain hash invalid".into(),
            });
        }
        prev = Some(receipt.chain_hash.clone());
    }
    Ok(receipts.len())
}

/// Last `n` receipts, oldest first. A missing log reads as empty.
pub fn tail(path: impl AsRef<Path>, n: usize) -> Result<Vec<TurnReceipt>, ReceiptError> {
    let mut receipts = read_all(path.as_ref())?;
    let skip = receipts.len().saturating_sub(n);
    Ok(receipts.split_off(skip))
}

fn read_all(path: &Path) -> Result<Vec<TurnReceipt>, ReceiptError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ReceiptError::Io(e.to_string())),
    };
    serde_json::Deserializer::from_reader(BufReader::new(file))
        .into_iter::<TurnReceipt>()
        .map(|r| r.map_err(|e| ReceiptError::Parse(e.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn temp_log() -> PathBuf {
        std::env::temp_dir().join(format!("tally_receipts_{}.jsonl", Uuid::new_v4()))
    }

    fn receipt(outcome: TurnOutcome) -> TurnReceipt {
        TurnReceipt::new(
            "2026-01-01T00:00:00Z",
            Uuid::new_v4(),
            Some("s1".into()),
            outcome,
            Some("high".into()),
            &json!({"message": "sales by state"}),
            &json!({"answer": "UT leads"}),
        )
    }

    #[test]
    fn receipt_chain_verifies_across_reopen() {
        let path = temp_log();
        let log = ReceiptLog::open(&path).unwrap();
        let first = log.append(receipt(TurnOutcome::Answered)).unwrap();
        assert!(first.prev_hash.is_none());

        let log = ReceiptLog::open(&path).unwrap();
        let second = log.append(receipt(TurnOutcome::ValidationFailed)).unwrap();
        assert_eq!(second.prev_hash.as_deref(), Some(first.chain_hash.as_str()));
        assert_eq!(verify_log(&path).unwrap(), 2);

        let last = tail(&path, 1).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].outcome, TurnOutcome::ValidationFailed);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let path = temp_log();
        let log = ReceiptLog::open(&path).unwrap();
        log.append(receipt(TurnOutcome::Answered)).unwrap();
        log.append(receipt(TurnOutcome::Answered)).unwrap();

        let text = fs::read_to_string(&path).unwrap().replacen("answered", "error", 1);
        fs::write(&path, text).unwrap();
        assert!(matches!(verify_log(&path), Err(ReceiptError::Chain { line: 1, .. })));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn absent_and_empty_session_hash_differently() {
        let mut with_empty = receipt(TurnOutcome::Answered);
        with_empty.session_id = Some(String::new());
        let mut without = with_empty.clone();
        without.session_id = None;
        assert_ne!(seal(with_empty, None).chain_hash, seal(without, None).chain_hash);
    }

    #[test]
    fn concurrent_appends_keep_one_chain() {
        let path = temp_log();
        let log = std::sync::Arc::new(ReceiptLog::open(&path).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let log = std::sync::Arc::clone(&log);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        log.append(receipt(TurnOutcome::Answered)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(verify_log(&path).unwrap(), 20);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_log_is_empty() {
        let path = temp_log();
        assert_eq!(verify_log(&path).unwrap(), 0);
        assert!(tail(&path, 5).unwrap().is_empty());
    }
}
