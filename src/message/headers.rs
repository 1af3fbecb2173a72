use rfc2047_decoder::{Decoder, RecoverStrategy};
use tracing::warn;

/// Header fields of one message, in file order. Names keep their case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {

    /// First value of `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields.iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value of `name` with RFC 2047 encoded words decoded.
    pub fn decoded(&self, name: &str) -> Option<String> {
        self.get(name).map(decode_word)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

}

/// Reads the header block, up to the first empty line. Folded lines are
/// unfolded, lines that are neither a field nor a continuation are dropped.
pub fn parse_headers(message: &str) -> Headers {
    let mut fields: Vec<(String, String)> = vec![];
    for line in message.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = fields.last_mut() {
                value.push_str(line);
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':')
                && !name.is_empty() && !name.contains(' ') {
            fields.push((name.to_string(), value.trim_start().to_string()));
        }
    }
    for (_, value) in fields.iter_mut() {
        let trimmed = value.trim_end().len();
        value.truncate(trimmed);
    }
    Headers { fields }
}

pub fn decode_word(value: &str) -> String {
    let decoder = Decoder::new().too_long_encoded_word_strategy(RecoverStrategy::Skip);
    match decoder.decode(value.as_bytes()) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Cannot decode header value {value:?} : {e}");
            value.to_string()
        },
    }
}
