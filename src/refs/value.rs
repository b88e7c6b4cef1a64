use crate::pack::ObjectId;

/// Stored form of a reference: `<40 hex>\n` or `ref: <target>\n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    Direct(ObjectId),
    Symbolic(String),
}

impl RefValue {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?.trim();
        match text.strip_prefix("ref:") {
            Some(target) => {
                let target = target.trim();
                (!target.is_empty()).then(|| RefValue::Symbolic(target.to_string()))
            }
            None => ObjectId::from_hex(text).map(RefValue::Direct),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            RefValue::Direct(id) => format!("{}\n", id).into_bytes(),
            RefValue::Symbolic(target) => format!("ref: {}\n", target).into_bytes(),
        }
    }
}
