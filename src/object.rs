//! Object records: the unit the store persists and caches.

use crate::value::Value;
use std::collections::BTreeMap;

/// Unique identifier of a persistent object.
pub type Objnum = i64;

/// Key of a variable slot: the object that defined it plus its name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarKey {
    pub class: Objnum,
    pub name: String,
}

impl VarKey {
    pub fn new(class: Objnum, name: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
        }
    }
}

/// A compiled method as stored with its defining object.
///
/// Identifier fields index into the owning record's `idents` table and
/// literal operands of `opcodes` index into its `strings` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Method {
    pub name: String,
    pub flags: i64,
    pub access: i64,
    pub native: Option<i64>,
    pub args: Vec<i64>,
    pub rest: Option<i64>,
    pub vars: Vec<i64>,
    pub opcodes: Vec<i64>,
    pub error_lists: Vec<Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRecord {
    pub objnum: Objnum,
    pub parents: Vec<Objnum>,
    pub children: Vec<Objnum>,
    pub vars: BTreeMap<VarKey, Value>,
    pub methods: Option<Vec<Method>>,
    pub strings: Vec<String>,
    pub idents: Vec<String>,
    pub name: Option<String>,
    // Not persisted.
    dead: bool,
    search: u64,
}

impl ObjectRecord {
    pub fn new(objnum: Objnum, parents: Vec<Objnum>) -> Self {
        Self {
            objnum,
            parents,
            children: Vec::new(),
            vars: BTreeMap::new(),
            methods: None,
            strings: Vec::new(),
            idents: Vec::new(),
            name: None,
            dead: false,
            search: 0,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Flag the record for destruction once the last reference is discarded.
    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    pub fn get_var(&self, class: Objnum, name: &str) -> Option<&Value> {
        self.vars.get(&VarKey::new(class, name))
    }

    pub fn set_var(&mut self, class: Objnum, name: impl Into<String>, value: Value) -> Option<Value> {
        self.vars.insert(VarKey::new(class, name), value)
    }

    pub fn del_var(&mut self, class: Objnum, name: &str) -> Option<Value> {
        self.vars.remove(&VarKey::new(class, name))
    }

    pub fn add_method(&mut self, method: Method) {
        self.methods.get_or_insert_with(Vec::new).push(method);
    }

    pub fn find_method(&self, name: &str) -> Option<&Method> {
        self.methods.as_ref()?.iter().find(|m| m.name == name)
    }

    /// Index of `ident` in the identifier table, appending it if missing.
    pub fn intern_ident(&mut self, ident: &str) -> i64 {
        match self.idents.iter().position(|i| i == ident) {
            Some(pos) => pos as i64,
            None => {
                self.idents.push(ident.to_string());
                (self.idents.len() - 1) as i64
            }
        }
    }

    /// Index of `literal` in the string table, appending it if missing.
    pub fn intern_string(&mut self, literal: &str) -> i64 {
        match self.strings.iter().position(|s| s == literal) {
            Some(pos) => pos as i64,
            None => {
                self.strings.push(literal.to_string());
                (self.strings.len() - 1) as i64
            }
        }
    }

    /// Graph traversals stamp each record they reach. Returns `false` if the
    /// record already carries `stamp`, i.e. this traversal saw it before.
    pub fn visit(&mut self, stamp: u64) -> bool {
        if self.search == stamp {
            return false;
        }
        self.search = stamp;
        true
    }

    pub fn search_stamp(&self) -> u64 {
        self.search
    }

    pub(crate) fn add_child(&mut self, child: Objnum) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    pub(crate) fn remove_child(&mut self, child: Objnum) -> bool {
        let before = self.children.len();
        self.children.retain(|&c| c != child);
        before != self.children.len()
    }

    /// Replace `old` in the parent list with `replacement`, keeping order and
    /// dropping duplicates.
    pub(crate) fn replace_parent(&mut self, old: Objnum, replacement: &[Objnum]) {
        let mut parents = Vec::with_capacity(self.parents.len() + replacement.len());
        for &p in &self.parents {
            if p == old {
                for &r in replacement {
                    if r != self.objnum && !parents.contains(&r) {
                        parents.push(r);
                    }
                }
            } else if !parents.contains(&p) {
                parents.push(p);
            }
        }
        self.parents = parents;
    }
}
