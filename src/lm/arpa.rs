//! ARPA back-off language model reader.
//!
//! Consumes the standard ARPA layout (a `\data\` header declaring per-order
//! counts, one `\N-grams:` section per order, a closing `\end\`) and feeds an
//! [`ArpaSink`], mirroring the header/n-gram split the store's builder wants.
//! Word tokenization is external: entries carry integer word ids, and the
//! reader only consumes the logprob and backoff columns and the id sequence.
//!
//! A count mismatch between the header and a section is tolerated with a
//! warning unless `strict` is set.

use std::io::BufRead;

use tracing::{debug, warn};

use crate::constants::lm::MAX_NGRAM;
use crate::error::{Error, Result};

/// Build-time options for the LM store.
#[derive(Debug, Clone)]
pub struct ArpaOptions {
    /// Word id of the beginning-of-sentence symbol.
    pub bos_symbol: i32,
    /// Word id of the end-of-sentence symbol.
    pub eos_symbol: i32,
    /// Word id unseen words map to; -1 when the model has none.
    pub unk_symbol: i32,
    /// Multiplicative scale applied to logprob and backoff columns.
    pub scale: f32,
    /// Seed for the hash coefficient sampling; fixed so builds reproduce.
    pub seed: u64,
    /// Turn header/section count mismatches into hard errors.
    pub strict: bool,
}

impl Default for ArpaOptions {
    fn default() -> Self {
        Self {
            bos_symbol: 1,
            eos_symbol: 2,
            unk_symbol: 3,
            scale: 1.0,
            seed: crate::constants::lm::DEFAULT_HASH_SEED,
            strict: false,
        }
    }
}

fn bad(line: usize, message: impl Into<String>) -> Error {
    Error::BadFormat {
        line,
        message: message.into(),
    }
}

/// Receiver for parsed ARPA content; the store's builder implements this.
pub(crate) trait ArpaSink {
    /// Called once with the declared per-order counts.
    fn header(&mut self, counts: &[usize]) -> Result<()>;
    /// Called per entry with word ids oldest-first, as ARPA writes them.
    fn ngram(&mut self, words: &[i32], logprob: f32, backoff: f32) -> Result<()>;
}

/// Parse ARPA text into `sink`.
pub(crate) fn parse_arpa<R: BufRead>(reader: R, strict: bool, sink: &mut dyn ArpaSink) -> Result<()> {
    let mut lines = reader.lines().enumerate();

    // Anything before \data\ is preamble.
    loop {
        match lines.next() {
            Some((_, line)) => {
                if line?.trim() == "\\data\\" {
                    break;
                }
            }
            None => return Err(Error::Truncated("missing \\data\\ section".to_string())),
        }
    }

    // Header: "ngram N=count" lines, orders ascending from 1.
    let mut counts: Vec<usize> = Vec::new();
    let mut section: Option<usize> = None;
    loop {
        let Some((no, line)) = lines.next() else {
            return Err(Error::Truncated("header ends without n-gram sections".to_string()));
        };
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(order) = parse_section_header(trimmed, no + 1)? {
            section = Some(order);
            break;
        }
        let rest = trimmed
            .strip_prefix("ngram ")
            .ok_or_else(|| bad(no + 1, format!("expected 'ngram N=count', got '{}'", trimmed)))?;
        let (order_str, count_str) = rest
            .split_once('=')
            .ok_or_else(|| bad(no + 1, "expected '=' in ngram count line"))?;
        let order: usize = order_str
            .trim()
            .parse()
            .map_err(|_| bad(no + 1, "unparseable n-gram order"))?;
        let count: usize = count_str
            .trim()
            .parse()
            .map_err(|_| bad(no + 1, "unparseable n-gram count"))?;
        if order != counts.len() + 1 {
            return Err(bad(no + 1, "n-gram orders must ascend from 1"));
        }
        if order >= MAX_NGRAM {
            return Err(bad(
                no + 1,
                format!("n-gram order {} exceeds the supported maximum", order),
            ));
        }
        counts.push(count);
    }

    if counts.is_empty() {
        return Err(Error::Truncated("\\data\\ declared no n-gram orders".to_string()));
    }
    debug!(orders = counts.len(), ?counts, "ARPA header read");
    sink.header(&counts)?;

    // N-gram sections.
    let mut read_counts = vec![0usize; counts.len()];
    let mut current = section.ok_or_else(|| Error::Truncated("no n-gram section".to_string()))?;
    let mut saw_end = false;
    let mut words = Vec::with_capacity(MAX_NGRAM);
    for (no, line) in lines {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "\\end\\" {
            saw_end = true;
            break;
        }
        if let Some(order) = parse_section_header(trimmed, no + 1)? {
            current = order;
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        let logprob: f32 = fields
            .next()
            .ok_or_else(|| bad(no + 1, "empty n-gram entry"))?
            .parse()
            .map_err(|_| bad(no + 1, "unparseable log-probability"))?;
        words.clear();
        for _ in 0..current {
            let id: i32 = fields
                .next()
                .ok_or_else(|| bad(no + 1, format!("entry needs {} word ids", current)))?
                .parse()
                .map_err(|_| bad(no + 1, "unparseable word id"))?;
            words.push(id);
        }
        let backoff: f32 = match fields.next() {
            Some(field) => field
                .parse()
                .map_err(|_| bad(no + 1, "unparseable backoff weight"))?,
            None => 0.0,
        };
        if fields.next().is_some() {
            return Err(bad(no + 1, "trailing fields after backoff column"));
        }

        if current > read_counts.len() {
            return Err(bad(no + 1, "section order exceeds the header"));
        }
        read_counts[current - 1] += 1;
        sink.ngram(&words, logprob, backoff)?;
    }

    if !saw_end {
        return Err(Error::Truncated("missing \\end\\ marker".to_string()));
    }

    for (i, (&declared, &read)) in counts.iter().zip(read_counts.iter()).enumerate() {
        if declared != read {
            if strict {
                return Err(Error::Inconsistent {
                    order: i + 1,
                    declared,
                    read,
                });
            }
            warn!(
                order = i + 1,
                declared, read, "n-gram count mismatch in ARPA header"
            );
        }
    }
    Ok(())
}

/// Recognize a `\N-grams:` section header; errors on other backslash lines.
fn parse_section_header(trimmed: &str, line_no: usize) -> Result<Option<usize>> {
    if !trimmed.starts_with('\\') {
        return Ok(None);
    }
    if let Some(rest) = trimmed.strip_prefix('\\') {
        if let Some(order_str) = rest.strip_suffix("-grams:") {
            let order: usize = order_str
                .parse()
                .map_err(|_| bad(line_no, "unparseable section order"))?;
            if order == 0 || order >= MAX_NGRAM {
                return Err(bad(line_no, format!("unsupported section order {}", order)));
            }
            return Ok(Some(order));
        }
    }
    Err(bad(line_no, format!("unexpected section marker '{}'", trimmed)))
}
