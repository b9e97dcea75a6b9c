//! Library members missing from older runtimes that have a known lowering.

use crate::constant_pool::{MemberKind, MemberRef};

/// How a call to a missing member is rewritten. Each variant names the
/// helper body emitted by the `replace-api-calls` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiLowering {
    ListOf,
    SetOf,
    MapOf,
    MapEntry,
    RequireNonNullElse,
    RequireNonNullElseGet,
    ReadAllBytes,
    TransferTo,
    BufferCovariant,
    OptionalOrElseThrow,
    OptionalIsEmpty,
    StringIsBlank,
    CharSequenceIsEmpty,
    StreamToList,
    ListCopyOf,
    SetCopyOf,
    MapCopyOf,
    MapOfEntries,
    OptionalOr,
    OptionalIfPresentOrElse,
    OptionalStream,
    MatcherAppendReplacement,
    MatcherAppendTail,
    FilesReadString,
    ReaderTransferTo,
    ToUnmodifiableList,
    ToUnmodifiableSet,
    ToUnmodifiableMap,
    CharacterToString,
    ClassArrayType,
    CollectionToArray,
    ParseIntRange,
    ExceptionallyAsync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiMember {
    pub owner: &'static str,
    pub name: &'static str,
    /// `None` matches every overload.
    pub descriptor: Option<&'static str>,
    pub is_static: bool,
    /// Major version of the first release shipping the member.
    pub since: u16,
    pub lowering: ApiLowering,
}

const fn member(
    owner: &'static str,
    name: &'static str,
    descriptor: Option<&'static str>,
    is_static: bool,
    since: u16,
    lowering: ApiLowering,
) -> ApiMember {
    ApiMember {
        owner,
        name,
        descriptor,
        is_static,
        since,
        lowering,
    }
}

static TABLE: &[ApiMember] = &[
    member("java/util/List", "of", None, true, 53, ApiLowering::ListOf),
    member("java/util/Set", "of", None, true, 53, ApiLowering::SetOf),
    member("java/util/Map", "of", None, true, 53, ApiLowering::MapOf),
    member(
        "java/util/Map",
        "entry",
        Some("(Ljava/lang/Object;Ljava/lang/Object;)Ljava/util/Map$Entry;"),
        true,
        53,
        ApiLowering::MapEntry,
    ),
    member(
        "java/util/Objects",
        "requireNonNullElse",
        Some("(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;"),
        true,
        53,
        ApiLowering::RequireNonNullElse,
    ),
    member(
        "java/util/Objects",
        "requireNonNullElseGet",
        Some("(Ljava/lang/Object;Ljava/util/function/Supplier;)Ljava/lang/Object;"),
        true,
        53,
        ApiLowering::RequireNonNullElseGet,
    ),
    member("java/io/InputStream", "readAllBytes", Some("()[B"), false, 53, ApiLowering::ReadAllBytes),
    member(
        "java/io/InputStream",
        "transferTo",
        Some("(Ljava/io/OutputStream;)J"),
        false,
        53,
        ApiLowering::TransferTo,
    ),
    member("java/util/Optional", "orElseThrow", Some("()Ljava/lang/Object;"), false, 54, ApiLowering::OptionalOrElseThrow),
    member("java/util/Optional", "isEmpty", Some("()Z"), false, 55, ApiLowering::OptionalIsEmpty),
    member("java/lang/String", "isBlank", Some("()Z"), false, 55, ApiLowering::StringIsBlank),
    member("java/lang/CharSequence", "isEmpty", Some("()Z"), false, 59, ApiLowering::CharSequenceIsEmpty),
    member("java/util/stream/Stream", "toList", Some("()Ljava/util/List;"), false, 60, ApiLowering::StreamToList),
    member(
        "java/util/List",
        "copyOf",
        Some("(Ljava/util/Collection;)Ljava/util/List;"),
        true,
        54,
        ApiLowering::ListCopyOf,
    ),
    member(
        "java/util/Set",
        "copyOf",
        Some("(Ljava/util/Collection;)Ljava/util/Set;"),
        true,
        54,
        ApiLowering::SetCopyOf,
    ),
    member("java/util/Map", "copyOf", Some("(Ljava/util/Map;)Ljava/util/Map;"), true, 54, ApiLowering::MapCopyOf),
    member(
        "java/util/Map",
        "ofEntries",
        Some("([Ljava/util/Map$Entry;)Ljava/util/Map;"),
        true,
        53,
        ApiLowering::MapOfEntries,
    ),
    member(
        "java/util/Optional",
        "or",
        Some("(Ljava/util/function/Supplier;)Ljava/util/Optional;"),
        false,
        53,
        ApiLowering::OptionalOr,
    ),
    member(
        "java/util/Optional",
        "ifPresentOrElse",
        Some("(Ljava/util/function/Consumer;Ljava/lang/Runnable;)V"),
        false,
        53,
        ApiLowering::OptionalIfPresentOrElse,
    ),
    member(
        "java/util/Optional",
        "stream",
        Some("()Ljava/util/stream/Stream;"),
        false,
        53,
        ApiLowering::OptionalStream,
    ),
    member(
        "java/util/regex/Matcher",
        "appendReplacement",
        Some("(Ljava/lang/StringBuilder;Ljava/lang/String;)Ljava/util/regex/Matcher;"),
        false,
        53,
        ApiLowering::MatcherAppendReplacement,
    ),
    member(
        "java/util/regex/Matcher",
        "appendTail",
        Some("(Ljava/lang/StringBuilder;)Ljava/lang/StringBuilder;"),
        false,
        53,
        ApiLowering::MatcherAppendTail,
    ),
    member("java/nio/file/Files", "readString", None, true, 55, ApiLowering::FilesReadString),
    member("java/io/Reader", "transferTo", Some("(Ljava/io/Writer;)J"), false, 54, ApiLowering::ReaderTransferTo),
    member(
        "java/util/stream/Collectors",
        "toUnmodifiableList",
        Some("()Ljava/util/stream/Collector;"),
        true,
        54,
        ApiLowering::ToUnmodifiableList,
    ),
    member(
        "java/util/stream/Collectors",
        "toUnmodifiableSet",
        Some("()Ljava/util/stream/Collector;"),
        true,
        54,
        ApiLowering::ToUnmodifiableSet,
    ),
    member("java/util/stream/Collectors", "toUnmodifiableMap", None, true, 54, ApiLowering::ToUnmodifiableMap),
    member(
        "java/lang/Character",
        "toString",
        Some("(I)Ljava/lang/String;"),
        true,
        55,
        ApiLowering::CharacterToString,
    ),
    member("java/lang/Class", "arrayType", Some("()Ljava/lang/Class;"), false, 56, ApiLowering::ClassArrayType),
    member(
        "java/lang/Integer",
        "parseInt",
        Some("(Ljava/lang/CharSequence;III)I"),
        true,
        53,
        ApiLowering::ParseIntRange,
    ),
    member(
        "java/util/concurrent/CompletableFuture",
        "exceptionallyAsync",
        None,
        false,
        56,
        ApiLowering::ExceptionallyAsync,
    ),
];

/// Collection types through which `toArray(IntFunction)` is commonly called.
static COLLECTION_TYPES: [&str; 5] = [
    "java/util/Collection",
    "java/util/List",
    "java/util/Set",
    "java/util/Queue",
    "java/util/Deque",
];

const TO_ARRAY_GENERATOR: &str = "(Ljava/util/function/IntFunction;)[Ljava/lang/Object;";

/// Buffer subclasses that gained covariant overrides in Java 9.
static BUFFER_TYPES: [&str; 7] = [
    "java/nio/ByteBuffer",
    "java/nio/CharBuffer",
    "java/nio/ShortBuffer",
    "java/nio/IntBuffer",
    "java/nio/LongBuffer",
    "java/nio/FloatBuffer",
    "java/nio/DoubleBuffer",
];

static BUFFER_METHODS: [(&str, &str); 7] = [
    ("flip", "()"),
    ("clear", "()"),
    ("rewind", "()"),
    ("mark", "()"),
    ("reset", "()"),
    ("position", "(I)"),
    ("limit", "(I)"),
];

/// Looks up a referenced member, returning `None` for anything that exists
/// in Java 8.
pub fn lookup(member: &MemberRef) -> Option<ApiMember> {
    if member.kind == MemberKind::Field {
        return None;
    }
    if let Some(found) = TABLE.iter().find(|api| {
        api.owner == member.owner
            && api.name == member.name
            && api.descriptor.is_none_or(|d| d == member.descriptor)
    }) {
        return Some(*found);
    }
    collection_to_array(member).or_else(|| buffer_override(member))
}

fn collection_to_array(member: &MemberRef) -> Option<ApiMember> {
    let owner = COLLECTION_TYPES.iter().find(|t| **t == member.owner)?;
    (member.name == "toArray" && member.descriptor == TO_ARRAY_GENERATOR).then_some(ApiMember {
        owner: *owner,
        name: "toArray",
        descriptor: Some(TO_ARRAY_GENERATOR),
        is_static: false,
        since: 55,
        lowering: ApiLowering::CollectionToArray,
    })
}

fn buffer_override(member: &MemberRef) -> Option<ApiMember> {
    let owner = BUFFER_TYPES.iter().find(|t| **t == member.owner)?;
    let (name, params) = BUFFER_METHODS.iter().find(|(n, _)| *n == member.name)?;
    let expected = format!("{params}L{owner};");
    (member.descriptor == expected).then_some(ApiMember {
        owner: *owner,
        name: *name,
        descriptor: None,
        is_static: false,
        since: 53,
        lowering: ApiLowering::BufferCovariant,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(owner: &str, name: &str, descriptor: &str, kind: MemberKind) -> MemberRef {
        MemberRef {
            kind,
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    #[test]
    fn finds_any_arity_of_list_of() {
        let m = method("java/util/List", "of", "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/util/List;", MemberKind::InterfaceMethod);
        assert_eq!(lookup(&m).map(|a| a.lowering), Some(ApiLowering::ListOf));
    }

    #[test]
    fn covariant_buffer_returns_only() {
        let flip = method("java/nio/ByteBuffer", "flip", "()Ljava/nio/ByteBuffer;", MemberKind::Method);
        assert_eq!(lookup(&flip).map(|a| a.lowering), Some(ApiLowering::BufferCovariant));
        let java8_flip = method("java/nio/ByteBuffer", "flip", "()Ljava/nio/Buffer;", MemberKind::Method);
        assert!(lookup(&java8_flip).is_none());
    }

    #[test]
    fn versions_follow_release() {
        let blank = method("java/lang/String", "isBlank", "()Z", MemberKind::Method);
        assert_eq!(lookup(&blank).map(|a| a.since), Some(55));
        let length = method("java/lang/String", "length", "()I", MemberKind::Method);
        assert!(lookup(&length).is_none());
    }

    #[test]
    fn to_array_generator_matches_collection_subtypes() {
        let list = method("java/util/List", "toArray", TO_ARRAY_GENERATOR, MemberKind::InterfaceMethod);
        assert_eq!(lookup(&list).map(|a| a.lowering), Some(ApiLowering::CollectionToArray));
        let typed = method(
            "java/util/List",
            "toArray",
            "([Ljava/lang/Object;)[Ljava/lang/Object;",
            MemberKind::InterfaceMethod,
        );
        assert!(lookup(&typed).is_none());
    }

    #[test]
    fn character_to_string_only_for_code_points() {
        let code_point = method("java/lang/Character", "toString", "(I)Ljava/lang/String;", MemberKind::Method);
        assert_eq!(lookup(&code_point).map(|a| a.since), Some(55));
        let char_form = method("java/lang/Character", "toString", "(C)Ljava/lang/String;", MemberKind::Method);
        assert!(lookup(&char_form).is_none());
    }
}
