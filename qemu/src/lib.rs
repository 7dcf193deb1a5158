pub mod base;
pub mod device;
pub mod drive;
pub mod firmware;

use std::fmt::Display;

pub struct QEMU {
    args: Vec<String>,
}

impl QEMU {
    pub fn new(binary: &str) -> Self {
        QEMU { args: vec![binary.to_string()] }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn option(self, name: &str, value: impl Display) -> Self {
        self.arg(name).arg(&value.to_string())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Vec<String> {
        self.args
    }
}

/// Escapes a value for use inside a comma separated option list.
pub fn escape(value: &str) -> String {
    value.replace(',', ",,")
}

/// Comma separated `key=value` property list, e.g. `virtio-blk-pci,drive=hd0,bootindex=1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Props {
    parts: Vec<String>,
}

impl Props {
    pub fn new(head: &str) -> Self {
        Props { parts: vec![head.to_string()] }
    }

    pub fn empty() -> Self {
        Props { parts: Vec::new() }
    }

    pub fn set(mut self, key: &str, value: impl Display) -> Self {
        self.parts.push(format!("{}={}", key, escape(&value.to_string())));
        self
    }

    pub fn opt<V: Display>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.set(key, value),
            None => self,
        }
    }

    pub fn flag(self, key: &str, on: bool) -> Self {
        if on { self.set(key, "on") } else { self }
    }

    pub fn raw(mut self, part: &str) -> Self {
        self.parts.push(part.to_string());
        self
    }
}

impl Display for Props {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.parts.join(","))
    }
}
