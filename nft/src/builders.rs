use std::fmt::Display;

use crate::Nft;

#[derive(Debug, Clone, Copy)]
pub enum Family {
    Inet,
}

impl Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Inet => write!(f, "inet"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Hook {
    Postrouting,
}

impl Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Hook::Postrouting => write!(f, "postrouting"),
        }
    }
}

pub struct Add {
    nft: Nft,
}

pub struct Delete {
    nft: Nft,
}

impl Nft {
    pub fn add(self) -> Add {
        Add { nft: self.push("add") }
    }

    pub fn delete(self) -> Delete {
        Delete { nft: self.push("delete") }
    }
}

impl Add {
    pub fn table(self, family: Family, name: &str) -> Nft {
        self.nft.push("table").push(&family.to_string()).push(name)
    }

    /// Base chain, e.g. `{ type nat hook postrouting priority 100 ; }`.
    pub fn chain(self, family: Family, table: &str, name: &str, kind: &str, hook: Hook, priority: i32) -> Nft {
        self.nft
            .push("chain")
            .push(&family.to_string())
            .push(table)
            .push(name)
            .push(&format!("{{ type {} hook {} priority {} ; }}", kind, hook, priority))
    }

    pub fn rule(self, family: Family, table: &str, chain: &str, rule: &[&str]) -> Nft {
        let mut nft = self.nft
            .push("rule")
            .push(&family.to_string())
            .push(table)
            .push(chain);
        for part in rule {
            nft = nft.push(part);
        }
        nft
    }
}

impl Delete {
    pub fn table(self, family: Family, name: &str) -> Nft {
        self.nft.push("table").push(&family.to_string()).push(name)
    }
}
