/// A processing instruction:
/// `<?target data?>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingInstruction {
    /// The target of the processing instruction.
    pub target: String,

    /// The content following the target, if any.
    pub data: Option<String>,
}
impl ProcessingInstruction {
    /// Create a new processing instruction.
    pub fn new(target: impl Into<String>, data: Option<impl Into<String>>) -> Self {
        Self {
            target: target.into(),
            data: data.map(Into::into),
        }
    }
}
