//! Class descriptors, type descriptors, and the class resolution service.
//!
//! The bridge never reflects over host types directly; everything it
//! knows about a class comes from a [`ClassDescriptor`] registered with
//! the resolution service. Proxy/bytecode generation for script-defined
//! subclasses lives outside the bridge and is consumed only through the
//! [`ClassResolutionService`] trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::BridgeError;

/// Member visibility. Only public and protected members are visible to
/// the script side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

/// Declared type of a parameter, return value, or field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDesc {
    Void,
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Char,
    Str,
    /// A class or interface, by fully qualified dotted name.
    Object(String),
}

impl TypeDesc {
    pub fn is_primitive(&self) -> bool {
        !matches!(self, TypeDesc::Void | TypeDesc::Str | TypeDesc::Object(_))
    }
}

/// JNI-style type descriptor, e.g. `I` or `Lapp/media/Track;`.
pub fn type_signature(ty: &TypeDesc) -> String {
    match ty {
        TypeDesc::Void => "V".to_string(),
        TypeDesc::Bool => "Z".to_string(),
        TypeDesc::Byte => "B".to_string(),
        TypeDesc::Short => "S".to_string(),
        TypeDesc::Int => "I".to_string(),
        TypeDesc::Long => "J".to_string(),
        TypeDesc::Float => "F".to_string(),
        TypeDesc::Double => "D".to_string(),
        TypeDesc::Char => "C".to_string(),
        TypeDesc::Str => "Ljava/lang/String;".to_string(),
        TypeDesc::Object(name) => format!("L{};", name.replace(['.', '$'], "/")),
    }
}

/// JNI-style method descriptor, e.g. `(IJ)V`.
pub fn method_signature(params: &[TypeDesc], ret: &TypeDesc) -> String {
    let mut sig = String::from("(");
    for param in params {
        sig.push_str(&type_signature(param));
    }
    sig.push(')');
    sig.push_str(&type_signature(ret));
    sig
}

/// One declared method or constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    pub name: String,
    pub visibility: Visibility,
    pub is_static: bool,
    pub params: Vec<TypeDesc>,
    pub ret: TypeDesc,
}

impl MethodDescriptor {
    pub fn new(name: impl Into<String>, params: Vec<TypeDesc>, ret: TypeDesc) -> Self {
        Self {
            name: name.into(),
            visibility: Visibility::Public,
            is_static: false,
            params,
            ret,
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn static_member(mut self) -> Self {
        self.is_static = true;
        self
    }

    /// Signature string of this method, `(params)ret`.
    pub fn signature(&self) -> String {
        method_signature(&self.params, &self.ret)
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub visibility: Visibility,
    pub is_static: bool,
    pub ty: TypeDesc,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, ty: TypeDesc) -> Self {
        Self {
            name: name.into(),
            visibility: Visibility::Public,
            is_static: false,
            ty,
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn static_member(mut self) -> Self {
        self.is_static = true;
        self
    }
}

/// Everything the bridge knows about one host class.
///
/// Names are fully qualified and dotted; `$` separates enclosing types
/// from nested ones (`a.b.Outer$Inner`).
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDescriptor {
    pub name: String,
    pub base: Option<String>,
    pub interfaces: Vec<String>,
    pub is_interface: bool,
    pub is_static: bool,
    /// For wrapper classes: the primitive this class boxes.
    pub boxes: Option<TypeDesc>,
    pub methods: Vec<MethodDescriptor>,
    pub fields: Vec<FieldDescriptor>,
}

impl ClassDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            interfaces: Vec::new(),
            is_interface: false,
            is_static: false,
            boxes: None,
            methods: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn with_interface(mut self, name: impl Into<String>) -> Self {
        self.interfaces.push(name.into());
        self
    }

    pub fn interface(mut self) -> Self {
        self.is_interface = true;
        self
    }

    pub fn boxing(mut self, primitive: TypeDesc) -> Self {
        self.boxes = Some(primitive);
        self
    }

    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Package segments of the name (everything before the first type
    /// segment).
    pub fn package_chain(&self) -> Vec<String> {
        let type_part = self.name.rsplit('.').next().unwrap_or(&self.name);
        let prefix_len = self.name.len() - type_part.len();
        if prefix_len == 0 {
            return Vec::new();
        }
        self.name[..prefix_len - 1]
            .split('.')
            .map(str::to_string)
            .collect()
    }

    /// Enclosing type names, outermost first (`Outer` for
    /// `a.b.Outer$Inner`).
    pub fn enclosing_types(&self) -> Vec<String> {
        let type_part = self.name.rsplit('.').next().unwrap_or(&self.name);
        let mut parts: Vec<String> = type_part.split('$').map(str::to_string).collect();
        parts.pop();
        parts
    }
}

/// Resolves and stores class descriptors by name.
///
/// `resolve_class` is the narrow window onto the external proxy
/// generation subsystem: it produces a descriptor for a script-defined
/// subclass of `base_class` carrying the requested overrides.
pub trait ClassResolutionService: Send + Sync {
    fn resolve_class(
        &self,
        base_class: &str,
        full_class: &str,
        overrides: &[String],
        interfaces: &[String],
        is_interface: bool,
    ) -> Result<Arc<ClassDescriptor>, BridgeError>;

    fn retrieve_class(&self, name: &str) -> Result<Arc<ClassDescriptor>, BridgeError>;

    fn store_class(&self, name: &str, descriptor: Arc<ClassDescriptor>);
}

/// In-memory descriptor store with a derivation-based `resolve_class`.
#[derive(Default)]
pub struct ClassRegistry {
    classes: Mutex<HashMap<String, Arc<ClassDescriptor>>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClassResolutionService for ClassRegistry {
    fn resolve_class(
        &self,
        base_class: &str,
        full_class: &str,
        overrides: &[String],
        interfaces: &[String],
        is_interface: bool,
    ) -> Result<Arc<ClassDescriptor>, BridgeError> {
        if let Ok(existing) = self.retrieve_class(full_class) {
            return Ok(existing);
        }

        let base = self.retrieve_class(base_class)?;

        // The derived descriptor re-declares the overridden base members;
        // generating the actual dispatch stubs is the proxy generator's
        // job, outside the bridge.
        let methods = base
            .methods
            .iter()
            .filter(|m| {
                !m.is_static
                    && m.visibility != Visibility::Private
                    && overrides.iter().any(|name| name == &m.name)
            })
            .cloned()
            .collect();

        let descriptor = Arc::new(ClassDescriptor {
            name: full_class.to_string(),
            base: Some(base_class.to_string()),
            interfaces: interfaces.to_vec(),
            is_interface,
            is_static: false,
            boxes: None,
            methods,
            fields: Vec::new(),
        });

        log::debug!(
            "resolved class {} (base {}, {} override(s))",
            full_class,
            base_class,
            overrides.len()
        );

        self.store_class(full_class, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    fn retrieve_class(&self, name: &str) -> Result<Arc<ClassDescriptor>, BridgeError> {
        self.classes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::ClassNotFound(name.to_string()))
    }

    fn store_class(&self, name: &str, descriptor: Arc<ClassDescriptor>) {
        self.classes
            .lock()
            .unwrap()
            .insert(name.to_string(), descriptor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_signatures() {
        assert_eq!(type_signature(&TypeDesc::Int), "I");
        assert_eq!(type_signature(&TypeDesc::Long), "J");
        assert_eq!(
            type_signature(&TypeDesc::Object("app.media.Track".into())),
            "Lapp/media/Track;"
        );
        assert_eq!(
            method_signature(&[TypeDesc::Int, TypeDesc::Bool], &TypeDesc::Void),
            "(IZ)V"
        );
    }

    #[test]
    fn test_name_chains() {
        let desc = ClassDescriptor::new("a.b.Outer$Inner");
        assert_eq!(desc.package_chain(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(desc.enclosing_types(), vec!["Outer".to_string()]);

        let plain = ClassDescriptor::new("Simple");
        assert!(plain.package_chain().is_empty());
        assert!(plain.enclosing_types().is_empty());
    }

    #[test]
    fn test_resolve_class_derives_from_base() {
        let registry = ClassRegistry::new();
        registry.store_class(
            "app.Base",
            Arc::new(
                ClassDescriptor::new("app.Base")
                    .with_method(MethodDescriptor::new("onCreate", vec![], TypeDesc::Void))
                    .with_method(MethodDescriptor::new("ignored", vec![], TypeDesc::Void)),
            ),
        );

        let derived = registry
            .resolve_class("app.Base", "app.Base_Script", &["onCreate".into()], &[], false)
            .unwrap();

        assert_eq!(derived.base.as_deref(), Some("app.Base"));
        assert_eq!(derived.methods.len(), 1);
        assert_eq!(derived.methods[0].name, "onCreate");

        // Stored for later retrieval.
        assert!(registry.retrieve_class("app.Base_Script").is_ok());
    }
}
