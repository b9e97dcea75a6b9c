//! Feature kinds, findings and the detectors that produce them.
//!
//! Detectors only read the class. Each reports every occurrence it
//! recognises together with the version that introduced it; callers filter
//! through [`TargetPolicy`] to keep only what the target cannot load.

use serde::Serialize;
use std::fmt;

use crate::api;
use crate::attributes::{self, BootstrapMethod};
use crate::classfile::{ClassFile, DescriptorSlot, SIGNATURE, access};
use crate::code::{self, Insn, op};
use crate::constant_pool::{Constant, ConstantPool, MethodHandleRef, ref_kind};
use crate::error::ClassFormatError;
use crate::version::{JavaVersion, TargetPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    StringConcat,
    PrivateInterfaceMethod,
    ModuleDescriptor,
    NestMates,
    DynamicConstant,
    Record,
    ObjectMethodsCallSite,
    SealedClass,
    PatternSwitch,
    UnreproducibleCallSite,
    VersionedAttribute,
    MissingApi,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 12] = [
        FeatureKind::StringConcat,
        FeatureKind::PrivateInterfaceMethod,
        FeatureKind::ModuleDescriptor,
        FeatureKind::NestMates,
        FeatureKind::DynamicConstant,
        FeatureKind::Record,
        FeatureKind::ObjectMethodsCallSite,
        FeatureKind::SealedClass,
        FeatureKind::PatternSwitch,
        FeatureKind::UnreproducibleCallSite,
        FeatureKind::VersionedAttribute,
        FeatureKind::MissingApi,
    ];

    /// Earliest version any occurrence of this kind can require.
    pub fn introduced_in(self) -> JavaVersion {
        match self {
            FeatureKind::StringConcat
            | FeatureKind::PrivateInterfaceMethod
            | FeatureKind::ModuleDescriptor
            | FeatureKind::UnreproducibleCallSite
            | FeatureKind::VersionedAttribute
            | FeatureKind::MissingApi => JavaVersion::JAVA_9,
            FeatureKind::NestMates | FeatureKind::DynamicConstant => JavaVersion::JAVA_11,
            FeatureKind::Record | FeatureKind::ObjectMethodsCallSite => JavaVersion::JAVA_16,
            FeatureKind::SealedClass => JavaVersion::JAVA_17,
            FeatureKind::PatternSwitch => JavaVersion::JAVA_21,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FeatureKind::StringConcat => "string-concat",
            FeatureKind::PrivateInterfaceMethod => "private-interface-method",
            FeatureKind::ModuleDescriptor => "module-descriptor",
            FeatureKind::NestMates => "nest-mates",
            FeatureKind::DynamicConstant => "dynamic-constant",
            FeatureKind::Record => "record",
            FeatureKind::ObjectMethodsCallSite => "object-methods-call-site",
            FeatureKind::SealedClass => "sealed-class",
            FeatureKind::PatternSwitch => "pattern-switch",
            FeatureKind::UnreproducibleCallSite => "unreproducible-call-site",
            FeatureKind::VersionedAttribute => "versioned-attribute",
            FeatureKind::MissingApi => "missing-api",
        }
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where in a class file a construct sits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum Location {
    Class,
    Attribute {
        name: String,
    },
    Field {
        name: String,
        descriptor: String,
    },
    Method {
        name: String,
        descriptor: String,
    },
    Instruction {
        method: String,
        descriptor: String,
        offset: u32,
    },
    Constant {
        index: u16,
    },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Class => f.write_str("class declaration"),
            Location::Attribute { name } => write!(f, "attribute {name}"),
            Location::Field { name, descriptor } => write!(f, "field {name}:{descriptor}"),
            Location::Method { name, descriptor } => write!(f, "method {name}{descriptor}"),
            Location::Instruction {
                method,
                descriptor,
                offset,
            } => write!(f, "{method}{descriptor} offset {offset}"),
            Location::Constant { index } => write!(f, "constant #{index}"),
        }
    }
}

/// One occurrence of a versioned construct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureFinding {
    pub kind: FeatureKind,
    pub location: Location,
    pub introduced_in: JavaVersion,
    /// Human readable description of the construct.
    pub construct: String,
}

impl FeatureFinding {
    fn new(kind: FeatureKind, location: Location, introduced_in: JavaVersion, construct: impl Into<String>) -> Self {
        Self {
            kind,
            location,
            introduced_in,
            construct: construct.into(),
        }
    }

    fn at_kind_version(kind: FeatureKind, location: Location, construct: impl Into<String>) -> Self {
        Self::new(kind, location, kind.introduced_in(), construct)
    }
}

type Detector = fn(&ClassFile) -> Result<Vec<FeatureFinding>, ClassFormatError>;

/// Detectors with the kinds each can report.
const DETECTORS: &[(&[FeatureKind], Detector)] = &[
    (
        &[
            FeatureKind::StringConcat,
            FeatureKind::ObjectMethodsCallSite,
            FeatureKind::PatternSwitch,
            FeatureKind::UnreproducibleCallSite,
        ],
        detect_call_sites,
    ),
    (&[FeatureKind::PrivateInterfaceMethod], detect_private_interface_methods),
    (&[FeatureKind::ModuleDescriptor], detect_module),
    (&[FeatureKind::NestMates], detect_nest_mates),
    (&[FeatureKind::DynamicConstant], detect_dynamic_constants),
    (&[FeatureKind::Record], detect_record),
    (&[FeatureKind::SealedClass], detect_sealed),
    (&[FeatureKind::VersionedAttribute], detect_versioned_attributes),
    (&[FeatureKind::MissingApi], detect_missing_api),
];

/// Findings of the requested kinds that the target cannot load.
pub fn detect(
    class: &ClassFile,
    policy: &TargetPolicy,
    kinds: &[FeatureKind],
) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    let mut findings = Vec::new();
    for (reported, detector) in DETECTORS {
        if !reported.iter().any(|k| kinds.contains(k)) {
            continue;
        }
        if reported.iter().all(|k| policy.is_legal(*k)) {
            continue;
        }
        findings.extend(
            detector(class)?
                .into_iter()
                .filter(|f| kinds.contains(&f.kind) && policy.is_violating(f)),
        );
    }
    Ok(findings)
}

pub fn detect_all(class: &ClassFile, policy: &TargetPolicy) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    detect(class, policy, &FeatureKind::ALL)
}

/// A method body scanned for detection.
pub(crate) struct ScannedMethod {
    pub index: usize,
    pub name: String,
    pub descriptor: String,
    pub insns: Vec<(u32, Insn)>,
}

impl ScannedMethod {
    pub(crate) fn at(&self, offset: u32) -> Location {
        Location::Instruction {
            method: self.name.clone(),
            descriptor: self.descriptor.clone(),
            offset,
        }
    }
}

pub(crate) fn scan_methods(class: &ClassFile) -> Result<Vec<ScannedMethod>, ClassFormatError> {
    let pool = &class.constant_pool;
    let mut out = Vec::new();
    for (index, method) in class.methods.iter().enumerate() {
        let Some(code_index) = method.code_attribute_index(pool) else {
            continue;
        };
        let (name, descriptor) = class.member_name(method.name_index, method.descriptor_index)?;
        out.push(ScannedMethod {
            index,
            name,
            descriptor,
            insns: code::scan(&method.attributes[code_index].info)?,
        });
    }
    Ok(out)
}

/// An `invokedynamic` or dynamic constant resolved to its bootstrap.
#[derive(Debug, Clone)]
pub(crate) struct CallSite {
    pub bootstrap: MethodHandleRef,
    pub arguments: Vec<u16>,
    pub name: String,
    pub descriptor: String,
}

impl CallSite {
    pub(crate) fn is(&self, owner: &str, name: &str) -> bool {
        self.bootstrap.member.owner == owner && self.bootstrap.member.name == name
    }

    pub(crate) fn bootstrap_display(&self) -> String {
        format!("{}.{}", self.bootstrap.member.owner, self.bootstrap.member.name)
    }
}

pub(crate) fn resolve_call_site(
    pool: &ConstantPool,
    bootstraps: &[BootstrapMethod],
    index: u16,
) -> Result<CallSite, ClassFormatError> {
    let dynamic = pool.dynamic(index)?;
    let entry = bootstraps
        .get(dynamic.bootstrap_index as usize)
        .ok_or_else(|| {
            ClassFormatError::attribute(
                attributes::BOOTSTRAP_METHODS,
                format!("bootstrap index {} out of range", dynamic.bootstrap_index),
            )
        })?;
    Ok(CallSite {
        bootstrap: pool.method_handle(entry.method_ref)?,
        arguments: entry.arguments.clone(),
        name: dynamic.name,
        descriptor: dynamic.descriptor,
    })
}

pub const STRING_CONCAT_FACTORY: &str = "java/lang/invoke/StringConcatFactory";
pub const OBJECT_METHODS: &str = "java/lang/runtime/ObjectMethods";
pub const SWITCH_BOOTSTRAPS: &str = "java/lang/runtime/SwitchBootstraps";
pub const CONSTANT_BOOTSTRAPS: &str = "java/lang/invoke/ConstantBootstraps";
pub const LAMBDA_METAFACTORY: &str = "java/lang/invoke/LambdaMetafactory";

/// JDK bootstrap classes that do not exist in Java 8, with the major version
/// that added them.
const NEWER_BOOTSTRAP_OWNERS: [(&str, u16); 5] = [
    (STRING_CONCAT_FACTORY, 53),
    (CONSTANT_BOOTSTRAPS, 55),
    (OBJECT_METHODS, 60),
    (SWITCH_BOOTSTRAPS, 65),
    ("java/lang/runtime/TemplateRuntime", 65),
];

fn classify_call_site(site: &CallSite) -> Option<(FeatureKind, JavaVersion, String)> {
    let bootstrap = site.bootstrap_display();
    if site.is(STRING_CONCAT_FACTORY, "makeConcatWithConstants") || site.is(STRING_CONCAT_FACTORY, "makeConcat") {
        return Some((FeatureKind::StringConcat, FeatureKind::StringConcat.introduced_in(), format!("string concatenation via {bootstrap}")));
    }
    if site.is(OBJECT_METHODS, "bootstrap") {
        return Some((
            FeatureKind::ObjectMethodsCallSite,
            FeatureKind::ObjectMethodsCallSite.introduced_in(),
            format!("{} call site via {bootstrap}", site.name),
        ));
    }
    if site.is(SWITCH_BOOTSTRAPS, "typeSwitch") || site.is(SWITCH_BOOTSTRAPS, "enumSwitch") {
        return Some((FeatureKind::PatternSwitch, FeatureKind::PatternSwitch.introduced_in(), format!("pattern switch via {bootstrap}")));
    }
    let owner = site.bootstrap.member.owner.as_str();
    NEWER_BOOTSTRAP_OWNERS
        .iter()
        .find(|(o, _)| *o == owner)
        .and_then(|(_, major)| JavaVersion::from_major(*major))
        .map(|version| {
            (
                FeatureKind::UnreproducibleCallSite,
                version,
                format!("call site bootstrapped by {bootstrap}"),
            )
        })
}

fn detect_call_sites(class: &ClassFile) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    let pool = &class.constant_pool;
    let bootstraps = attributes::bootstrap_methods(class)?;
    let mut findings = Vec::new();
    for method in scan_methods(class)? {
        for (offset, insn) in &method.insns {
            let Insn::InvokeDynamic { index } = insn else {
                continue;
            };
            let site = resolve_call_site(pool, &bootstraps, *index)?;
            if let Some((kind, version, construct)) = classify_call_site(&site) {
                findings.push(FeatureFinding::new(kind, method.at(*offset), version, construct));
            }
        }
    }
    Ok(findings)
}

fn detect_private_interface_methods(class: &ClassFile) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    if !class.is_interface() {
        return Ok(Vec::new());
    }
    let mut findings = Vec::new();
    for method in &class.methods {
        if method.access_flags & access::PRIVATE != 0 && !method.is_static() {
            let (name, descriptor) = class.member_name(method.name_index, method.descriptor_index)?;
            let construct = format!("private interface method {name}{descriptor}");
            findings.push(FeatureFinding::at_kind_version(
                FeatureKind::PrivateInterfaceMethod,
                Location::Method { name, descriptor },
                construct,
            ));
        }
    }
    Ok(findings)
}

fn detect_module(class: &ClassFile) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    let is_module = class.access_flags & access::MODULE != 0 || class.has_attribute("Module");
    Ok(if is_module {
        vec![FeatureFinding::at_kind_version(
            FeatureKind::ModuleDescriptor,
            Location::Class,
            "module descriptor",
        )]
    } else {
        Vec::new()
    })
}

fn detect_nest_mates(class: &ClassFile) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    let mut findings = Vec::new();
    if let Some(host) = attributes::nest_host(class)? {
        findings.push(FeatureFinding::at_kind_version(
            FeatureKind::NestMates,
            Location::Attribute {
                name: attributes::NEST_HOST.to_string(),
            },
            format!("nest member of {host}"),
        ));
    }
    if class.has_attribute(attributes::NEST_MEMBERS) {
        findings.push(FeatureFinding::at_kind_version(
            FeatureKind::NestMates,
            Location::Attribute {
                name: attributes::NEST_MEMBERS.to_string(),
            },
            "nest host",
        ));
    }
    Ok(findings)
}

fn detect_dynamic_constants(class: &ClassFile) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    let pool = &class.constant_pool;
    let bootstraps = attributes::bootstrap_methods(class)?;
    let mut findings = Vec::new();
    for (index, constant) in pool.iter() {
        if !matches!(constant, Constant::Dynamic { .. }) {
            continue;
        }
        let site = resolve_call_site(pool, &bootstraps, index)?;
        findings.push(FeatureFinding::at_kind_version(
            FeatureKind::DynamicConstant,
            Location::Constant { index },
            format!("dynamic constant {} bootstrapped by {}", site.name, site.bootstrap_display()),
        ));
    }
    Ok(findings)
}

fn detect_record(class: &ClassFile) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    let mut findings = Vec::new();
    if class.super_name()?.as_deref() == Some(RECORD_CLASS) {
        findings.push(FeatureFinding::at_kind_version(
            FeatureKind::Record,
            Location::Class,
            "record class extending java/lang/Record",
        ));
    }
    if class.has_attribute(attributes::RECORD) {
        findings.push(FeatureFinding::at_kind_version(
            FeatureKind::Record,
            Location::Attribute {
                name: attributes::RECORD.to_string(),
            },
            "record component list",
        ));
    }

    let pool = &class.constant_pool;
    for (index, constant) in pool.iter() {
        let Constant::Class { name_index } = constant else {
            continue;
        };
        if index != class.super_class && names_record(&pool.utf8(*name_index)?) {
            findings.push(FeatureFinding::at_kind_version(
                FeatureKind::Record,
                Location::Constant { index },
                format!("reference to {RECORD_CLASS}"),
            ));
        }
    }
    for (slot, utf8) in class.descriptor_slots()? {
        let text = pool.utf8(utf8)?;
        if text.contains(RECORD_DESCRIPTOR) {
            findings.push(FeatureFinding::at_kind_version(
                FeatureKind::Record,
                slot_location(class, slot)?,
                format!("{RECORD_CLASS} in {text}"),
            ));
        }
    }
    Ok(findings)
}

pub const RECORD_CLASS: &str = "java/lang/Record";
const RECORD_DESCRIPTOR: &str = "Ljava/lang/Record;";

/// Whether a `Class` constant's name is `java/lang/Record` or an array of it.
pub(crate) fn names_record(name: &str) -> bool {
    name == RECORD_CLASS || (name.starts_with('[') && name.contains(RECORD_DESCRIPTOR))
}

fn slot_location(class: &ClassFile, slot: DescriptorSlot) -> Result<Location, ClassFormatError> {
    Ok(match slot {
        DescriptorSlot::Field(i) | DescriptorSlot::FieldSignature { field: i, .. } => {
            let field = &class.fields[i];
            let (name, descriptor) = class.member_name(field.name_index, field.descriptor_index)?;
            Location::Field { name, descriptor }
        }
        DescriptorSlot::Method(i) | DescriptorSlot::MethodSignature { method: i, .. } => {
            let method = &class.methods[i];
            let (name, descriptor) = class.member_name(method.name_index, method.descriptor_index)?;
            Location::Method { name, descriptor }
        }
        DescriptorSlot::NameAndType(index) | DescriptorSlot::MethodType(index) => Location::Constant { index },
        DescriptorSlot::ClassSignature(_) => Location::Attribute {
            name: SIGNATURE.to_string(),
        },
    })
}

fn detect_sealed(class: &ClassFile) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    let Some(attr) = class.attribute(attributes::PERMITTED_SUBCLASSES) else {
        return Ok(Vec::new());
    };
    let permitted = attributes::class_list(&class.constant_pool, attr, attributes::PERMITTED_SUBCLASSES)?;
    Ok(vec![FeatureFinding::at_kind_version(
        FeatureKind::SealedClass,
        Location::Attribute {
            name: attributes::PERMITTED_SUBCLASSES.to_string(),
        },
        format!("sealed class permitting {}", permitted.join(", ")),
    )])
}

fn detect_versioned_attributes(class: &ClassFile) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    let mut findings = Vec::new();
    for attr in &class.attributes {
        let name = class.constant_pool.utf8(attr.name_index)?;
        let Some(version) = attributes::introduced_in(&name).and_then(JavaVersion::from_major) else {
            continue;
        };
        findings.push(FeatureFinding::new(
            FeatureKind::VersionedAttribute,
            Location::Attribute {
                name: name.to_string(),
            },
            version,
            format!("{name} attribute"),
        ));
    }
    Ok(findings)
}

fn detect_missing_api(class: &ClassFile) -> Result<Vec<FeatureFinding>, ClassFormatError> {
    let pool = &class.constant_pool;
    let mut findings = Vec::new();
    for method in scan_methods(class)? {
        for (offset, insn) in &method.insns {
            let index = match insn {
                Insn::Member { opcode, index } if *opcode >= op::INVOKEVIRTUAL => *index,
                Insn::InvokeInterface { index, .. } => *index,
                _ => continue,
            };
            let member = pool.member_ref(index)?;
            if let Some(api) = api::lookup(&member) {
                if let Some(version) = JavaVersion::from_major(api.since) {
                    findings.push(FeatureFinding::new(
                        FeatureKind::MissingApi,
                        method.at(*offset),
                        version,
                        format!("call to {}.{}{}", member.owner, member.name, member.descriptor),
                    ));
                }
            }
        }
    }

    for bootstrap in attributes::bootstrap_methods(class)? {
        let handle = pool.method_handle(bootstrap.method_ref)?;
        if handle.member.owner != LAMBDA_METAFACTORY {
            continue;
        }
        for &arg in &bootstrap.arguments {
            let Constant::MethodHandle { reference_kind, .. } = pool.get(arg)? else {
                continue;
            };
            if *reference_kind < ref_kind::INVOKE_VIRTUAL {
                continue;
            }
            let target = pool.method_handle(arg)?;
            if let Some(version) = api::lookup(&target.member).and_then(|api| JavaVersion::from_major(api.since)) {
                findings.push(FeatureFinding::new(
                    FeatureKind::MissingApi,
                    Location::Constant { index: arg },
                    version,
                    format!(
                        "method reference to {}.{}{}",
                        target.member.owner, target.member.name, target.member.descriptor
                    ),
                ));
            }
        }
    }
    Ok(findings)
}
