//! The global symbol table and the rules for merging definitions into it.
//!
//! Every symbol from every loaded object lands here. Local symbols are
//! appended unconditionally; global and weak symbols go through `add`, which
//! decides whether the incoming definition replaces, merges with, or loses to
//! what we already have.

use crate::bail;
use crate::error::Result;
use crate::sections::SectionId;
use foldhash::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SymbolId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolPlacement {
    Undefined,
    Absolute,
    Common,
    Section(SectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    Local,
    Global,
    Weak,
}

impl Binding {
    pub(crate) fn from_st_bind(bind: u8) -> Result<Binding> {
        match bind {
            object::elf::STB_LOCAL => Ok(Binding::Local),
            object::elf::STB_GLOBAL => Ok(Binding::Global),
            object::elf::STB_WEAK => Ok(Binding::Weak),
            other => bail!("unsupported symbol binding {other}"),
        }
    }

    pub(crate) fn st_bind(self) -> u8 {
        match self {
            Binding::Local => object::elf::STB_LOCAL,
            Binding::Global => object::elf::STB_GLOBAL,
            Binding::Weak => object::elf::STB_WEAK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SymbolKind {
    NoType,
    Object,
    Func,
    Section,
    Tls,
}

impl SymbolKind {
    pub(crate) fn from_st_type(st_type: u8) -> SymbolKind {
        match st_type {
            object::elf::STT_OBJECT => SymbolKind::Object,
            object::elf::STT_FUNC => SymbolKind::Func,
            object::elf::STT_SECTION => SymbolKind::Section,
            object::elf::STT_TLS => SymbolKind::Tls,
            _ => SymbolKind::NoType,
        }
    }

    pub(crate) fn st_type(self) -> u8 {
        match self {
            SymbolKind::NoType => object::elf::STT_NOTYPE,
            SymbolKind::Object => object::elf::STT_OBJECT,
            SymbolKind::Func => object::elf::STT_FUNC,
            SymbolKind::Section => object::elf::STT_SECTION,
            SymbolKind::Tls => object::elf::STT_TLS,
        }
    }
}

/// Ordered from least to most constraining. When two definitions of a name
/// disagree, the more constraining visibility wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Visibility {
    Default,
    Protected,
    Hidden,
    Internal,
}

impl Visibility {
    pub(crate) fn from_st_other(st_other: u8) -> Visibility {
        match st_other & 0x3 {
            object::elf::STV_INTERNAL => Visibility::Internal,
            object::elf::STV_HIDDEN => Visibility::Hidden,
            object::elf::STV_PROTECTED => Visibility::Protected,
            _ => Visibility::Default,
        }
    }

    pub(crate) fn st_other(self) -> u8 {
        match self {
            Visibility::Default => object::elf::STV_DEFAULT,
            Visibility::Protected => object::elf::STV_PROTECTED,
            Visibility::Hidden => object::elf::STV_HIDDEN,
            Visibility::Internal => object::elf::STV_INTERNAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Symbol {
    pub(crate) name: String,
    pub(crate) placement: SymbolPlacement,

    /// Section-relative until addresses are assigned, then absolute. For
    /// COMMON symbols this holds the required alignment.
    pub(crate) value: u64,

    pub(crate) size: u64,
    pub(crate) binding: Binding,
    pub(crate) kind: SymbolKind,
    pub(crate) visibility: Visibility,
}

impl Symbol {
    pub(crate) fn is_defined(&self) -> bool {
        self.placement != SymbolPlacement::Undefined
    }
}

pub(crate) struct SymbolDb {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, SymbolId>,
}

impl SymbolDb {
    pub(crate) fn new() -> SymbolDb {
        SymbolDb {
            symbols: Vec::new(),
            by_name: HashMap::default(),
        }
    }

    /// Adds `symbol`, merging it with any existing symbol of the same name
    /// according to binding precedence. Returns the id now holding the name.
    pub(crate) fn add(&mut self, symbol: Symbol) -> Result<SymbolId> {
        if symbol.binding == Binding::Local {
            return Ok(self.push(symbol));
        }
        let Some(&id) = self.by_name.get(&symbol.name) else {
            let id = self.push(symbol.clone());
            self.by_name.insert(symbol.name, id);
            return Ok(id);
        };

        let existing = &mut self.symbols[id.0 as usize];
        existing.visibility = existing.visibility.max(symbol.visibility);

        // Seeing the exact same definition again is harmless.
        if *existing == symbol {
            return Ok(id);
        }

        // References never displace anything; a definition always satisfies
        // an outstanding reference.
        if !symbol.is_defined() {
            return Ok(id);
        }
        if !existing.is_defined() {
            let visibility = existing.visibility.max(symbol.visibility);
            *existing = symbol;
            existing.visibility = visibility;
            return Ok(id);
        }

        // Both sides are defined from here on.
        match (existing.binding, symbol.binding) {
            (Binding::Global, Binding::Weak) | (Binding::Weak, Binding::Weak) => return Ok(id),
            (Binding::Weak, Binding::Global) => {
                let visibility = existing.visibility;
                *existing = symbol;
                existing.visibility = visibility.max(existing.visibility);
                return Ok(id);
            }
            _ => {}
        }

        match (existing.placement, symbol.placement) {
            // Tentative definitions merge; the strictest alignment and the
            // largest size survive.
            (SymbolPlacement::Common, SymbolPlacement::Common) => {
                existing.size = existing.size.max(symbol.size);
                existing.value = existing.value.max(symbol.value);
                Ok(id)
            }
            (SymbolPlacement::Common, _) => {
                let visibility = existing.visibility;
                *existing = symbol;
                existing.visibility = visibility.max(existing.visibility);
                Ok(id)
            }
            (_, SymbolPlacement::Common) => Ok(id),
            _ => {
                // A hidden or internal duplicate gives way to the existing
                // definition instead of clashing with it.
                if symbol.visibility >= Visibility::Hidden {
                    return Ok(id);
                }
                bail!("symbol `{}` defined more than once", symbol.name)
            }
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    pub(crate) fn len(&self) -> usize {
        self.symbols.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, symbol)| (SymbolId(i as u32), symbol))
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = SymbolId> + use<> {
        (0..self.symbols.len() as u32).map(SymbolId)
    }

    fn push(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(symbol);
        id
    }
}
