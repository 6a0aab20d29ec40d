//! Builder for `convert` argument vectors.
//!
//! ImageMagick reads its command line positionally: settings that apply to
//! the whole run must come before the input file, image operations come
//! after it, and the output file is last. [`ConvertArgs`] keeps the two flag
//! lists apart and renders them in that order.

use super::FlagValue;

/// Token meaning "read from stdin" or "write to stdout".
pub const STDIO_SENTINEL: &str = "-";

/// Ordered `convert` arguments.
///
/// Both token lists are append-only and are rendered in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertArgs {
    settings: Vec<String>,
    operations: Vec<String>,
    input: String,
    output: String,
}

impl Default for ConvertArgs {
    fn default() -> Self {
        Self::new()
    }
}

impl ConvertArgs {
    /// Create arguments that read stdin and write stdout with no flags.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: Vec::new(),
            operations: Vec::new(),
            input: STDIO_SENTINEL.to_string(),
            output: STDIO_SENTINEL.to_string(),
        }
    }

    /// Append a setting flag, placed before the input specifier.
    pub fn push_setting(&mut self, name: &str, value: impl Into<FlagValue>) {
        push_flag(&mut self.settings, name, value.into());
    }

    /// Append an operation flag, placed after the input specifier.
    pub fn push_operation(&mut self, name: &str, value: impl Into<FlagValue>) {
        push_flag(&mut self.operations, name, value.into());
    }

    /// Set the input format tag (`fmt:-`).
    pub fn set_input_format(&mut self, format: &str) {
        self.input = format!("{format}:{STDIO_SENTINEL}");
    }

    /// Set the output format tag (`fmt:-`).
    pub fn set_output_format(&mut self, format: &str) {
        self.output = format!("{format}:{STDIO_SENTINEL}");
    }

    /// Add a setting with a value.
    #[must_use]
    pub fn set(mut self, name: &str, value: impl Into<FlagValue>) -> Self {
        self.push_setting(name, value);
        self
    }

    /// Add a setting without a value.
    #[must_use]
    pub fn set_flag(self, name: &str) -> Self {
        self.set(name, FlagValue::None)
    }

    /// Add several settings.
    ///
    /// Entries are applied in the iterator's order. Use an ordered container
    /// such as a `Vec` of pairs when order matters: a `BTreeMap` yields its
    /// keys sorted and a `HashMap` in no particular order.
    #[must_use]
    pub fn set_all<K, V, I>(mut self, entries: I) -> Self
    where
        K: AsRef<str>,
        V: Into<FlagValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (name, value) in entries {
            self.push_setting(name.as_ref(), value);
        }
        self
    }

    /// Add an operation with a value.
    #[must_use]
    pub fn op(mut self, name: &str, value: impl Into<FlagValue>) -> Self {
        self.push_operation(name, value);
        self
    }

    /// Add an operation without a value.
    #[must_use]
    pub fn op_flag(self, name: &str) -> Self {
        self.op(name, FlagValue::None)
    }

    /// Add several operations, in the iterator's order.
    ///
    /// See [`ConvertArgs::set_all`] for the ordering caveat.
    #[must_use]
    pub fn op_all<K, V, I>(mut self, entries: I) -> Self
    where
        K: AsRef<str>,
        V: Into<FlagValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (name, value) in entries {
            self.push_operation(name.as_ref(), value);
        }
        self
    }

    /// Read the input with an explicit format, e.g. `jpg`.
    #[must_use]
    pub fn input_format(mut self, format: &str) -> Self {
        self.set_input_format(format);
        self
    }

    /// Write the output with an explicit format, e.g. `png`.
    #[must_use]
    pub fn output_format(mut self, format: &str) -> Self {
        self.set_output_format(format);
        self
    }

    #[must_use]
    pub fn quality(self, quality: impl Into<FlagValue>) -> Self {
        self.op("quality", quality)
    }

    #[must_use]
    pub fn resize(self, geometry: &str) -> Self {
        self.op("resize", geometry)
    }

    #[must_use]
    pub fn scale(self, geometry: &str) -> Self {
        self.op("scale", geometry)
    }

    #[must_use]
    pub fn crop(self, geometry: &str) -> Self {
        self.op("crop", geometry)
    }

    #[must_use]
    pub fn gravity(self, gravity: &str) -> Self {
        self.op("gravity", gravity)
    }

    #[must_use]
    pub fn thumbnail(self, geometry: &str) -> Self {
        self.op("thumbnail", geometry)
    }

    #[must_use]
    pub fn auto_orient(self) -> Self {
        self.op_flag("auto-orient")
    }

    /// Set the image type (`-type`).
    #[must_use]
    pub fn image_type(self, image_type: &str) -> Self {
        self.op("type", image_type)
    }

    /// Annotate the image with text at the given rotation.
    #[must_use]
    pub fn annotate(self, degrees: &str, text: &str) -> Self {
        self.op("annotate", [degrees, text])
    }

    /// The input specifier, `-` unless a format was set.
    #[must_use]
    pub fn input_spec(&self) -> &str {
        &self.input
    }

    /// The output specifier, `-` unless a format was set.
    #[must_use]
    pub fn output_spec(&self) -> &str {
        &self.output
    }

    /// Build the argument vector: `settings… input operations… output`.
    #[must_use]
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.settings.len() + self.operations.len() + 2);
        args.extend(self.settings.iter().cloned());
        args.push(self.input.clone());
        args.extend(self.operations.iter().cloned());
        args.push(self.output.clone());
        args
    }

    /// Render the full invocation as one shell-escaped line, for logs.
    #[must_use]
    pub fn command_line(&self, binary: &str) -> String {
        std::iter::once(binary.to_string())
            .chain(self.build_args())
            .map(|arg| shell_escape::escape(arg.into()).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn push_flag(tokens: &mut Vec<String>, name: &str, value: FlagValue) {
    if name.starts_with('-') || name.starts_with('+') {
        tokens.push(name.to_string());
    } else {
        tokens.push(format!("-{name}"));
    }
    tokens.extend(value.into_tokens());
}
