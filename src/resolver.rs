//! Overload resolution against registered class descriptors.
//!
//! Given a class, a method name, and the runtime shapes of the actual
//! arguments, the resolver ranks every candidate overload per parameter
//! (exact match above primitive widening above boxing above subtype
//! above interface) and returns the signature of the unique best
//! candidate. Resolved signatures are cached per argument shape.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hostbridge::classes::{ClassDescriptor, ClassRegistry, ClassResolutionService,
//!     MethodDescriptor, TypeDesc};
//! use hostbridge::resolver::MethodResolver;
//! use hostbridge::value::Value;
//!
//! let registry = Arc::new(ClassRegistry::new());
//! registry.store_class(
//!     "app.Calc",
//!     Arc::new(ClassDescriptor::new("app.Calc")
//!         .with_method(MethodDescriptor::new("add", vec![TypeDesc::Int], TypeDesc::Int))
//!         .with_method(MethodDescriptor::new("add", vec![TypeDesc::Long], TypeDesc::Long))),
//! );
//! let resolver = MethodResolver::new(registry, 128);
//! let sig = resolver.resolve_method_overload("app.Calc", "add", &[Value::Int(1)]).unwrap();
//! assert_eq!(sig, "(I)I");
//! ```

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::classes::{ClassResolutionService, MethodDescriptor, TypeDesc, Visibility};
use crate::error::BridgeError;
use crate::value::Value;

/// Rank of one argument-to-parameter conversion. Higher is better.
const RANK_EXACT: u32 = 5;
const RANK_WIDENING: u32 = 4;
const RANK_BOXING: u32 = 3;
const RANK_SUBTYPE: u32 = 2;
const RANK_INTERFACE: u32 = 1;

/// Reserved method name for instance initializers. Calls to it carry a
/// trailing flag telling the engine whether the call reached the
/// initializer through construction or through an explicit invocation.
pub const RESERVED_INITIALIZER: &str = "init";

type CacheKey = (String, String, String);

/// Declared-member summary handed to the engine when it materializes a
/// class proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeMetadata {
    pub name: String,
    pub package_chain: Vec<String>,
    pub enclosing_types: Vec<String>,
    pub is_interface: bool,
    pub is_static: bool,
    pub base: Option<String>,
    /// Script-visible declared instance methods, sorted by name.
    pub methods: Vec<MemberMetadata>,
    /// Script-visible declared instance fields, in declaration order.
    pub fields: Vec<MemberMetadata>,
}

/// One method or field entry of a [`TypeMetadata`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemberMetadata {
    pub name: String,
    pub signature: String,
    /// Declared parameter count; zero for fields.
    pub param_count: usize,
}

/// Ranks overloads and caches resolved signatures.
pub struct MethodResolver {
    classes: Arc<dyn ClassResolutionService>,
    cache: Mutex<LruCache<CacheKey, String>>,
}

impl MethodResolver {
    pub fn new(classes: Arc<dyn ClassResolutionService>, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).expect("cache size is at least 1");
        Self {
            classes,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Signature of the unique best `method` overload of `class_name`
    /// for the given arguments, e.g. `(IJ)V`.
    pub fn resolve_method_overload(
        &self,
        class_name: &str,
        method: &str,
        args: &[Value],
    ) -> Result<String, BridgeError> {
        let key = (
            class_name.to_string(),
            method.to_string(),
            arg_shape(args),
        );
        if let Some(sig) = self.cache.lock().unwrap().get(&key) {
            log::trace!("resolver: cache hit for {}.{}{}", key.0, key.1, key.2);
            return Ok(sig.clone());
        }

        let candidates = self.collect_candidates(class_name, method, args.len())?;
        let signature = self.pick_best(class_name, method, &candidates, args)?;

        self.cache.lock().unwrap().put(key, signature.clone());
        Ok(signature)
    }

    /// Signature of the unique best constructor of `class_name` for the
    /// given arguments. Constructors are the declared methods named
    /// [`RESERVED_INITIALIZER`].
    pub fn resolve_constructor(
        &self,
        class_name: &str,
        args: &[Value],
    ) -> Result<String, BridgeError> {
        self.resolve_method_overload(class_name, RESERVED_INITIALIZER, args)
    }

    /// Script-visible member summary of a class.
    pub fn type_metadata(&self, class_name: &str) -> Result<TypeMetadata, BridgeError> {
        let desc = self.classes.retrieve_class(class_name)?;

        let mut methods: Vec<MemberMetadata> = desc
            .methods
            .iter()
            .filter(|m| m.visibility != Visibility::Private && !m.is_static)
            .map(|m| MemberMetadata {
                name: m.name.clone(),
                signature: m.signature(),
                param_count: m.params.len(),
            })
            .collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));

        let fields = desc
            .fields
            .iter()
            .filter(|fd| fd.visibility != Visibility::Private && !fd.is_static)
            .map(|fd| MemberMetadata {
                name: fd.name.clone(),
                signature: crate::classes::type_signature(&fd.ty),
                param_count: 0,
            })
            .collect();

        Ok(TypeMetadata {
            name: desc.name.clone(),
            package_chain: desc.package_chain(),
            enclosing_types: desc.enclosing_types(),
            is_interface: desc.is_interface,
            is_static: desc.is_static,
            base: desc.base.clone(),
            methods,
            fields,
        })
    }

    /// Candidate overloads: script-visible methods with a matching name
    /// and arity, declared anywhere along the base chain.
    fn collect_candidates(
        &self,
        class_name: &str,
        method: &str,
        arity: usize,
    ) -> Result<Vec<MethodDescriptor>, BridgeError> {
        let mut candidates = Vec::new();
        let mut current = Some(class_name.to_string());

        while let Some(name) = current {
            let desc = match self.classes.retrieve_class(&name) {
                Ok(desc) => desc,
                // An unregistered ancestor ends the walk.
                Err(_) if name != class_name => break,
                Err(err) => return Err(err),
            };
            for m in &desc.methods {
                if m.name == method
                    && m.params.len() == arity
                    && m.visibility != Visibility::Private
                    && !candidates.iter().any(|c: &MethodDescriptor| {
                        c.name == m.name && c.params == m.params
                    })
                {
                    candidates.push(m.clone());
                }
            }
            // Initializers do not inherit.
            if method == RESERVED_INITIALIZER {
                break;
            }
            current = desc.base.clone();
        }

        Ok(candidates)
    }

    fn pick_best(
        &self,
        class_name: &str,
        method: &str,
        candidates: &[MethodDescriptor],
        args: &[Value],
    ) -> Result<String, BridgeError> {
        let mut best_score = 0u32;
        let mut best_sig: Option<String> = None;
        let mut tied = 0usize;

        for candidate in candidates {
            let Some(score) = self.score_candidate(candidate, args) else {
                continue;
            };
            if score > best_score {
                best_score = score;
                best_sig = Some(candidate.signature());
                tied = 1;
            } else if score == best_score && best_sig.is_some() {
                tied += 1;
            }
        }

        match (best_sig, tied) {
            (Some(sig), 1) => {
                log::debug!("resolver: {}.{} -> {}", class_name, method, sig);
                Ok(sig)
            }
            (Some(_), candidates) => Err(BridgeError::AmbiguousOverload {
                class: class_name.to_string(),
                method: method.to_string(),
                candidates,
            }),
            (None, _) => Err(BridgeError::NoMatchingOverload {
                class: class_name.to_string(),
                method: method.to_string(),
                arg_count: args.len(),
            }),
        }
    }

    /// Sum of per-parameter ranks, or `None` if any argument cannot
    /// convert to its parameter.
    fn score_candidate(&self, candidate: &MethodDescriptor, args: &[Value]) -> Option<u32> {
        let mut score = 0;
        for (arg, param) in args.iter().zip(&candidate.params) {
            score += self.rank(arg, param)?;
        }
        // Zero-arg overloads have nothing to rank but still match.
        Some(score.max(1))
    }

    fn rank(&self, arg: &Value, param: &TypeDesc) -> Option<u32> {
        match arg {
            Value::Null => match param {
                TypeDesc::Str | TypeDesc::Object(_) => Some(RANK_SUBTYPE),
                _ => None,
            },
            Value::String(_) => match param {
                TypeDesc::Str => Some(RANK_EXACT),
                _ => None,
            },
            Value::Object(obj) => self.rank_object(obj.class_name(), param),
            primitive => {
                let from = primitive_desc(primitive)?;
                self.rank_primitive(&from, param)
            }
        }
    }

    fn rank_primitive(&self, from: &TypeDesc, param: &TypeDesc) -> Option<u32> {
        if from == param {
            return Some(RANK_EXACT);
        }
        if widens_to(from, param) {
            return Some(RANK_WIDENING);
        }
        if let TypeDesc::Object(class) = param {
            let desc = self.classes.retrieve_class(class).ok()?;
            if desc.boxes.as_ref() == Some(from) {
                return Some(RANK_BOXING);
            }
        }
        None
    }

    fn rank_object(&self, arg_class: &str, param: &TypeDesc) -> Option<u32> {
        match param {
            TypeDesc::Object(class) => {
                if arg_class == class {
                    return Some(RANK_EXACT);
                }
                if self.is_subclass_of(arg_class, class) {
                    return Some(RANK_SUBTYPE);
                }
                if self.implements(arg_class, class) {
                    return Some(RANK_INTERFACE);
                }
                None
            }
            // Wrapper object against a primitive parameter: unboxing,
            // ranked as a boxing conversion. Unbox-then-widen is the
            // weakest accepted conversion.
            primitive if primitive.is_primitive() => {
                let desc = self.classes.retrieve_class(arg_class).ok()?;
                match &desc.boxes {
                    Some(boxed) if boxed == primitive => Some(RANK_BOXING),
                    Some(boxed) if widens_to(boxed, primitive) => Some(RANK_INTERFACE),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        let mut current = match self.classes.retrieve_class(class) {
            Ok(desc) => desc.base.clone(),
            Err(_) => return false,
        };
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = match self.classes.retrieve_class(&name) {
                Ok(desc) => desc.base.clone(),
                Err(_) => return false,
            };
        }
        false
    }

    /// Whether `class` (or an ancestor) implements `iface`, directly or
    /// through interface inheritance.
    fn implements(&self, class: &str, iface: &str) -> bool {
        let mut current = Some(class.to_string());
        while let Some(name) = current {
            let Ok(desc) = self.classes.retrieve_class(&name) else {
                return false;
            };
            for declared in &desc.interfaces {
                if declared == iface || self.interface_extends(declared, iface) {
                    return true;
                }
            }
            current = desc.base.clone();
        }
        false
    }

    fn interface_extends(&self, iface: &str, target: &str) -> bool {
        let Ok(desc) = self.classes.retrieve_class(iface) else {
            return false;
        };
        desc.interfaces
            .iter()
            .any(|parent| parent == target || self.interface_extends(parent, target))
    }
}

/// Declared-type view of a primitive runtime value.
fn primitive_desc(value: &Value) -> Option<TypeDesc> {
    match value {
        Value::Bool(_) => Some(TypeDesc::Bool),
        Value::Byte(_) => Some(TypeDesc::Byte),
        Value::Short(_) => Some(TypeDesc::Short),
        Value::Int(_) => Some(TypeDesc::Int),
        Value::Long(_) => Some(TypeDesc::Long),
        Value::Float(_) => Some(TypeDesc::Float),
        Value::Double(_) => Some(TypeDesc::Double),
        Value::Char(_) => Some(TypeDesc::Char),
        _ => None,
    }
}

/// Lossless primitive widening conversions.
fn widens_to(from: &TypeDesc, to: &TypeDesc) -> bool {
    use TypeDesc::*;
    matches!(
        (from, to),
        (Byte, Short | Int | Long | Float | Double)
            | (Short, Int | Long | Float | Double)
            | (Char, Int | Long | Float | Double)
            | (Int, Long | Float | Double)
            | (Long, Float | Double)
            | (Float, Double)
    )
}

/// Cache key component describing the runtime shape of the arguments.
fn arg_shape(args: &[Value]) -> String {
    let mut shape = String::from("(");
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            shape.push(',');
        }
        match arg {
            Value::Null => shape.push_str("null"),
            Value::Bool(_) => shape.push('Z'),
            Value::Byte(_) => shape.push('B'),
            Value::Short(_) => shape.push('S'),
            Value::Int(_) => shape.push('I'),
            Value::Long(_) => shape.push('J'),
            Value::Float(_) => shape.push('F'),
            Value::Double(_) => shape.push('D'),
            Value::Char(_) => shape.push('C'),
            Value::String(_) => shape.push('T'),
            Value::Object(obj) => shape.push_str(obj.class_name()),
        }
    }
    shape.push(')');
    shape
}
