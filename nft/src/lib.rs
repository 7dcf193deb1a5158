use std::path::Path;

pub mod builders;

/// Argument vector for one `nft` invocation, program first.
pub struct Nft {
    args: Vec<String>
}

impl Nft {
    pub fn new<P: AsRef<Path>>(binary: P) -> Nft {
        Nft {
            args: vec![binary.as_ref().to_string_lossy().to_string()],
        }
    }

    fn push(mut self, arg: &str) -> Nft {
        self.args.push(arg.to_string());
        self
    }

    pub fn build(self) -> Vec<String> {
        self.args
    }
}

impl Default for Nft {
    fn default() -> Self {
        Self::new("/usr/sbin/nft")
    }
}
