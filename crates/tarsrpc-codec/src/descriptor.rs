use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use crate::stamp::Stamp;

/// Liveness probe method; its body is always empty.
pub const PING_METHOD: &str = "tars_ping";

/// Most wire parameters a method can tag (tags 1..=255).
pub const MAX_WIRE_PARAMS: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// What a declared parameter is for.
///
/// Only `Value` parameters travel on the wire. `Context` receives the
/// call context map and `Callback` marks an asynchronous method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    Value(Direction),
    Context,
    Callback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    pub name: String,
    /// Ordinal tag; meaningful for `Value` parameters only.
    pub tag: u8,
    pub stamp: Option<Stamp>,
    pub role: ParamRole,
}

impl ParamDescriptor {
    pub fn is_wire(&self) -> bool {
        matches!(self.role, ParamRole::Value(_))
    }

    pub fn is_out(&self) -> bool {
        self.role == ParamRole::Value(Direction::Out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnDescriptor {
    pub tag: u8,
    pub stamp: Stamp,
}

/// Signature of one remote method. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub name: String,
    pub params: Vec<ParamDescriptor>,
    pub ret: Option<ReturnDescriptor>,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            ret: None,
        }
    }

    /// Descriptor of the liveness probe.
    pub fn ping() -> Self {
        Self::new(PING_METHOD)
    }

    pub fn input(self, name: impl Into<String>, stamp: Stamp) -> Self {
        self.value_param(name.into(), stamp, Direction::In)
    }

    pub fn output(self, name: impl Into<String>, stamp: Stamp) -> Self {
        self.value_param(name.into(), stamp, Direction::Out)
    }

    pub fn context(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamDescriptor {
            name: name.into(),
            tag: 0,
            stamp: None,
            role: ParamRole::Context,
        });
        self
    }

    pub fn callback(mut self, name: impl Into<String>) -> Self {
        self.params.push(ParamDescriptor {
            name: name.into(),
            tag: 0,
            stamp: None,
            role: ParamRole::Callback,
        });
        self
    }

    /// Declare a non-void return, written at tag 0.
    pub fn returns(mut self, stamp: Stamp) -> Self {
        self.ret = Some(ReturnDescriptor { tag: 0, stamp });
        self
    }

    // Wire parameters are tagged 1, 2, ... in declaration order. Past the
    // last tag they saturate, and `tags_overflow` reports it.
    fn value_param(mut self, name: String, stamp: Stamp, direction: Direction) -> Self {
        let tag = u8::try_from(self.params.iter().filter(|p| p.is_wire()).count())
            .ok()
            .and_then(|count| count.checked_add(1))
            .unwrap_or(u8::MAX);
        self.params.push(ParamDescriptor {
            name,
            tag,
            stamp: Some(stamp),
            role: ParamRole::Value(direction),
        });
        self
    }

    /// More wire parameters than tags; such a method has no tagged encoding.
    pub fn tags_overflow(&self) -> bool {
        self.wire_params().count() > MAX_WIRE_PARAMS
    }

    pub fn is_ping(&self) -> bool {
        self.name == PING_METHOD
    }

    /// A method with a callback parameter completes asynchronously.
    pub fn is_async(&self) -> bool {
        self.params.iter().any(|p| p.role == ParamRole::Callback)
    }

    /// Parameters that travel on the wire, with their stamps.
    pub fn wire_params(&self) -> impl Iterator<Item = (&ParamDescriptor, &Stamp)> {
        self.params
            .iter()
            .filter_map(|p| p.stamp.as_ref().filter(|_| p.is_wire()).map(|s| (p, s)))
    }

    pub fn inputs(&self) -> impl Iterator<Item = (&ParamDescriptor, &Stamp)> {
        self.wire_params().filter(|(p, _)| !p.is_out())
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&ParamDescriptor, &Stamp)> {
        self.wire_params().filter(|(p, _)| p.is_out())
    }
}

fn ping_descriptor() -> Arc<MethodDescriptor> {
    static PING: OnceLock<Arc<MethodDescriptor>> = OnceLock::new();
    Arc::clone(PING.get_or_init(|| Arc::new(MethodDescriptor::ping())))
}

/// The method table of one service interface.
///
/// Built once at init time; every interface implicitly answers the
/// liveness probe.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDescriptor {
    name: String,
    methods: BTreeMap<String, Arc<MethodDescriptor>>,
}

impl InterfaceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.insert(method.name.clone(), Arc::new(method));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookup(&self, method: &str) -> Option<Arc<MethodDescriptor>> {
        if method == PING_METHOD {
            return Some(ping_descriptor());
        }
        self.methods.get(method).cloned()
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodDescriptor>> {
        self.methods.values()
    }
}

/// Result of resolving `(servant, method)` on the server side.
#[derive(Debug, Clone)]
pub enum MethodLookup {
    Found(Arc<MethodDescriptor>),
    NoSuchServant,
    NoSuchMethod,
}

/// Source of method descriptors for inbound request decoding.
pub trait MethodRegistry: Send + Sync {
    fn lookup(&self, servant: &str, method: &str) -> MethodLookup;
}

/// Static servant name -> interface table.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    servants: HashMap<String, Arc<InterfaceDescriptor>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, servant: impl Into<String>, interface: Arc<InterfaceDescriptor>) {
        self.servants.insert(servant.into(), interface);
    }

    pub fn with(mut self, servant: impl Into<String>, interface: Arc<InterfaceDescriptor>) -> Self {
        self.register(servant, interface);
        self
    }
}

impl MethodRegistry for MethodTable {
    fn lookup(&self, servant: &str, method: &str) -> MethodLookup {
        match self.servants.get(servant) {
            None => MethodLookup::NoSuchServant,
            Some(interface) => match interface.lookup(method) {
                Some(found) => MethodLookup::Found(found),
                None => MethodLookup::NoSuchMethod,
            },
        }
    }
}
