//! Stop/bad word lists in the engine's `(batch, 2, max_ids)` layout.
//!
//! For every batch entry, row 0 holds the token ids of all words back to back
//! and row 1 holds the cumulative end offset of each word. Ids are padded
//! with `0` and offsets with `-1`.

use crate::tensor::HostTensor;
use crate::tokenizer::Tokenizer;
use crate::{Error, Result};

/// Prefix prepended to every word before encoding.
///
/// Many tokenizers encode a word differently at the start of a string than
/// after other text; encoding `prefix + word` and stripping the prefix ids
/// yields the mid-sentence form.
pub const DEFAULT_REF_STR: &str = "<extra_id_1>";

/// Encode comma-separated word lists for a batch.
///
/// `word_dict[i]` holds the words of batch entry `i`; only its first string
/// is used, parsed as one CSV record (`"a, b"` → `a`, ` b`; quotes allow
/// commas inside a word). Words that encode to no tokens are dropped.
///
/// Returns an `I32` tensor of shape `[batch, 2, max(1, longest id list)]`.
///
/// # Errors
/// Returns an error if the tokenizer fails or produces an id that does not
/// fit in `i32`.
pub fn to_word_list_format<T, S>(
    word_dict: &[Vec<S>],
    tokenizer: &T,
    ref_str: &str,
) -> Result<HostTensor>
where
    T: Tokenizer + ?Sized,
    S: AsRef<str>,
{
    let ids_ref = tokenizer.encode(ref_str)?;

    let mut flat_ids: Vec<Vec<i32>> = Vec::with_capacity(word_dict.len());
    let mut offsets: Vec<Vec<i32>> = Vec::with_capacity(word_dict.len());

    for item in word_dict {
        let words = item
            .first()
            .map(|s| parse_csv_record(s.as_ref()))
            .unwrap_or_default();

        let mut item_ids = Vec::new();
        let mut item_offsets = Vec::new();
        for word in &words {
            let ids = encode_word(tokenizer, word, ref_str, &ids_ref)?;
            if ids.is_empty() {
                continue;
            }
            for id in ids {
                item_ids.push(
                    i32::try_from(id)
                        .map_err(|_| Error::Tokenizer(format!("token id {id} exceeds i32")))?,
                );
            }
            let end = i32::try_from(item_ids.len())
                .map_err(|_| Error::Tokenizer("word list too long".into()))?;
            item_offsets.push(end);
        }

        flat_ids.push(item_ids);
        offsets.push(item_offsets);
    }

    let pad_to = flat_ids.iter().map(Vec::len).max().unwrap_or(0).max(1);

    let mut data = Vec::with_capacity(word_dict.len() * 2 * pad_to);
    for (ids, offs) in flat_ids.iter().zip(&offsets) {
        data.extend_from_slice(ids);
        data.resize(data.len() + pad_to - ids.len(), 0);
        data.extend_from_slice(offs);
        data.resize(data.len() + pad_to - offs.len(), -1);
    }

    HostTensor::from_i32(vec![word_dict.len(), 2, pad_to], &data)
}

/// Encode one word in mid-sentence form.
fn encode_word<T: Tokenizer + ?Sized>(
    tokenizer: &T,
    word: &str,
    ref_str: &str,
    ids_ref: &[u32],
) -> Result<Vec<u32>> {
    let ids = tokenizer.encode(&format!("{ref_str}{word}"))?;
    if let Some(rest) = ids.strip_prefix(ids_ref) {
        return Ok(rest.to_vec());
    }

    // The prefix merged with the word; fall back to encoding the word alone.
    let ids = tokenizer.encode(word)?;
    tracing::warn!(word, ?ids, "the encoding of this word into tokens might be incorrect");
    Ok(ids)
}

/// Split the first record of a CSV string into fields.
///
/// Fields are comma separated and kept verbatim, including surrounding
/// spaces. A field starting with `"` is quoted: commas inside it are literal
/// and `""` is an escaped quote. An unquoted newline ends the record.
fn parse_csv_record(line: &str) -> Vec<String> {
    if line.is_empty() {
        return Vec::new();
    }

    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut at_field_start = true;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }
        match c {
            '"' if at_field_start => {
                in_quotes = true;
                at_field_start = false;
            }
            ',' => {
                fields.push(std::mem::take(&mut field));
                at_field_start = true;
            }
            '\r' | '\n' => break,
            _ => {
                field.push(c);
                at_field_start = false;
            }
        }
    }
    fields.push(field);
    fields
}
