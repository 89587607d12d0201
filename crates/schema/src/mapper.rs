use std::collections::BTreeMap;

use mappa_core::{MappingError, MappingMetadata, MappingResult, MappingSource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use smallvec::SmallVec;

use crate::validate_type_name;

/// Leaf field types the parser knows how to handle.
pub const LEAF_TYPES: &[&str] = &[
    "string", "text", "keyword", "long", "integer", "short", "byte", "double", "float", "half_float",
    "boolean", "date", "binary", "ip", "geo_point", "geo_shape", "completion", "token_count",
];

/// Parameters accepted at the root of a type mapping besides `properties` and meta fields.
pub const ROOT_PARAMS: &[&str] = &[
    "dynamic", "enabled", "include_in_all", "date_detection", "numeric_detection", "dynamic_date_formats",
    "dynamic_templates",
];

fn is_root_key(key: &str) -> bool { key == "properties" || key.starts_with('_') || ROOT_PARAMS.contains(&key) }

/// A concrete field: scalar type plus its parameters and multi-fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafField {
    pub field_type: String,
    pub params: BTreeMap<String, Json>,
    pub fields: BTreeMap<String, LeafField>,
}

/// An object (or nested) field holding sub-properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectField {
    pub nested: bool,
    pub params: BTreeMap<String, Json>,
    pub properties: BTreeMap<String, FieldMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldMapping {
    Leaf(LeafField),
    Object(ObjectField),
}

impl FieldMapping {
    pub fn type_name(&self) -> &str {
        match self {
            FieldMapping::Leaf(l) => &l.field_type,
            FieldMapping::Object(o) if o.nested => "nested",
            FieldMapping::Object(_) => "object",
        }
    }
}

/// Parsed schema of one type. Immutable; merges produce new mappers.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMapper {
    type_name: String,
    root: ObjectField,
    parent: Option<String>,
    meta_fields: BTreeMap<String, Json>,
    source: MappingSource,
}

pub(crate) fn join(path: &str, name: &str) -> String {
    if path.is_empty() { name.to_string() } else { format!("{}.{}", path, name) }
}

/// Deep-merge `overlay` onto `base`; objects merge key by key, anything else is replaced.
pub fn deep_merge(base: &Json, overlay: &Json) -> Json {
    match (base, overlay) {
        (Json::Object(b), Json::Object(o)) => {
            let mut out = b.clone();
            for (k, v) in o {
                let merged = match b.get(k) {
                    Some(bv) => deep_merge(bv, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Json::Object(out)
        }
        (_, o) => o.clone(),
    }
}

fn parse_err(msg: impl Into<String>) -> MappingError { MappingError::MapperParsing(msg.into()) }

fn check_field_name(name: &str) -> MappingResult<()> {
    if name.is_empty() {
        return Err(parse_err("field name cannot be an empty string"));
    }
    if name.contains('.') {
        return Err(parse_err(format!("field name [{}] cannot contain '.'", name)));
    }
    Ok(())
}

fn parse_properties(props: &Json, path: &str) -> MappingResult<BTreeMap<String, FieldMapping>> {
    let map = props
        .as_object()
        .ok_or_else(|| parse_err(format!("expected map for [properties] under [{}]", if path.is_empty() { "_root" } else { path })))?;
    let mut out = BTreeMap::new();
    for (name, node) in map {
        check_field_name(name)?;
        let full = join(path, name);
        out.insert(name.clone(), parse_field(name, node, &full)?);
    }
    Ok(out)
}

fn parse_field(name: &str, node: &Json, full: &str) -> MappingResult<FieldMapping> {
    let obj = node
        .as_object()
        .ok_or_else(|| parse_err(format!("expected map for field [{}] but got [{}]", full, node)))?;
    let ty = match obj.get("type") {
        None => None,
        Some(Json::String(s)) => Some(s.as_str()),
        Some(other) => return Err(parse_err(format!("type of field [{}] must be a string, got [{}]", full, other))),
    };
    match ty {
        None | Some("object") | Some("nested") => {
            let mut field = ObjectField { nested: ty == Some("nested"), ..Default::default() };
            for (k, v) in obj {
                match k.as_str() {
                    "type" => {}
                    "properties" => field.properties = parse_properties(v, full)?,
                    _ => { field.params.insert(k.clone(), v.clone()); }
                }
            }
            Ok(FieldMapping::Object(field))
        }
        Some(t) if LEAF_TYPES.contains(&t) => Ok(FieldMapping::Leaf(parse_leaf(t, obj, full)?)),
        Some(t) => Err(parse_err(format!("no handler for type [{}] declared on field [{}]", t, name))),
    }
}

fn parse_leaf(field_type: &str, obj: &Map<String, Json>, full: &str) -> MappingResult<LeafField> {
    let mut leaf = LeafField { field_type: field_type.to_string(), params: BTreeMap::new(), fields: BTreeMap::new() };
    for (k, v) in obj {
        match k.as_str() {
            "type" => {}
            "properties" => return Err(parse_err(format!("field [{}] of type [{}] cannot declare properties", full, field_type))),
            "fields" => {
                let subs = v.as_object().ok_or_else(|| parse_err(format!("expected map for [fields] on field [{}]", full)))?;
                for (sub, sv) in subs {
                    check_field_name(sub)?;
                    let sub_full = join(full, sub);
                    match parse_field(sub, sv, &sub_full)? {
                        FieldMapping::Leaf(l) => { leaf.fields.insert(sub.clone(), l); }
                        FieldMapping::Object(_) => {
                            return Err(parse_err(format!("multi-field [{}] must be a leaf type", sub_full)));
                        }
                    }
                }
            }
            _ => { leaf.params.insert(k.clone(), v.clone()); }
        }
    }
    Ok(leaf)
}

fn leaf_to_json(leaf: &LeafField) -> Json {
    let mut m = Map::new();
    m.insert("type".into(), Json::String(leaf.field_type.clone()));
    for (k, v) in &leaf.params {
        m.insert(k.clone(), v.clone());
    }
    if !leaf.fields.is_empty() {
        let subs: Map<String, Json> = leaf.fields.iter().map(|(k, l)| (k.clone(), leaf_to_json(l))).collect();
        m.insert("fields".into(), Json::Object(subs));
    }
    Json::Object(m)
}

fn properties_to_json(props: &BTreeMap<String, FieldMapping>) -> Json {
    let m: Map<String, Json> = props.iter().map(|(k, f)| (k.clone(), field_to_json(f))).collect();
    Json::Object(m)
}

fn field_to_json(field: &FieldMapping) -> Json {
    match field {
        FieldMapping::Leaf(l) => leaf_to_json(l),
        FieldMapping::Object(o) => {
            let mut m = Map::new();
            if o.nested {
                m.insert("type".into(), Json::String("nested".into()));
            }
            for (k, v) in &o.params {
                m.insert(k.clone(), v.clone());
            }
            if !o.properties.is_empty() {
                m.insert("properties".into(), properties_to_json(&o.properties));
            }
            Json::Object(m)
        }
    }
}

impl DocumentMapper {
    /// Parse `source` as the mapping of `type_name`.
    ///
    /// The source may be wrapped in a single root key naming the type, or be
    /// the bare body. Without an explicit type the wrapper is required.
    /// `default_body` is laid underneath the parsed body when present.
    pub fn parse(type_name: Option<&str>, source: &MappingSource, default_body: Option<&Json>) -> MappingResult<Self> {
        let root = source.to_value()?;
        let obj = root.as_object().ok_or_else(|| parse_err("mapping source must be a JSON object"))?;
        let (type_name, body) = match type_name {
            Some(t) => match obj.iter().next() {
                Some((k, inner)) if obj.len() == 1 && k == t => (t.to_string(), inner.clone()),
                Some((k, _)) if obj.len() == 1 && !is_root_key(k) => {
                    return Err(MappingError::InvalidTypeName(format!(
                        "type name [{}] provided does not match type name [{}] within mapping definition",
                        t, k
                    )));
                }
                _ => (t.to_string(), root.clone()),
            },
            None => match obj.iter().next() {
                Some((k, v)) if obj.len() == 1 => (k.clone(), v.clone()),
                _ => return Err(parse_err("mapping source must hold the type name as its single root key")),
            },
        };
        validate_type_name(&type_name)?;
        let body = match default_body {
            Some(def) => deep_merge(def, &body),
            None => body,
        };
        Self::from_body(type_name, &body)
    }

    fn from_body(type_name: String, body: &Json) -> MappingResult<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| parse_err(format!("mapping body of type [{}] must be a JSON object", type_name)))?;
        let mut root = ObjectField::default();
        let mut parent = None;
        let mut meta_fields = BTreeMap::new();
        for (k, v) in obj {
            match k.as_str() {
                "properties" => root.properties = parse_properties(v, "")?,
                "_parent" => {
                    let p = v
                        .get("type")
                        .and_then(|t| t.as_str())
                        .filter(|t| !t.is_empty())
                        .ok_or_else(|| parse_err("[_parent] must declare a non-empty [type]"))?;
                    parent = Some(p.to_string());
                }
                "type" => return Err(parse_err(format!("root of type [{}] cannot declare a field type", type_name))),
                _ if k.starts_with('_') => { meta_fields.insert(k.clone(), v.clone()); }
                _ if ROOT_PARAMS.contains(&k.as_str()) => { root.params.insert(k.clone(), v.clone()); }
                _ => {
                    return Err(parse_err(format!("root mapping of type [{}] has unsupported parameter [{}]", type_name, k)));
                }
            }
        }
        Ok(Self::assemble(type_name, root, parent, meta_fields))
    }

    pub(crate) fn assemble(
        type_name: String,
        root: ObjectField,
        parent: Option<String>,
        meta_fields: BTreeMap<String, Json>,
    ) -> Self {
        let body = Self::body_json(&root, parent.as_deref(), &meta_fields);
        let mut wrapped = Map::new();
        wrapped.insert(type_name.clone(), body);
        let source = MappingSource::from_value(&Json::Object(wrapped));
        Self { type_name, root, parent, meta_fields, source }
    }

    fn body_json(root: &ObjectField, parent: Option<&str>, meta_fields: &BTreeMap<String, Json>) -> Json {
        let mut m = Map::new();
        for (k, v) in root.params.iter().chain(meta_fields.iter()) {
            m.insert(k.clone(), v.clone());
        }
        if let Some(p) = parent {
            m.insert("_parent".into(), serde_json::json!({ "type": p }));
        }
        if !root.properties.is_empty() {
            m.insert("properties".into(), properties_to_json(&root.properties));
        }
        Json::Object(m)
    }

    pub fn type_name(&self) -> &str { &self.type_name }
    pub fn root(&self) -> &ObjectField { &self.root }
    pub fn parent_type(&self) -> Option<&str> { self.parent.as_deref() }
    pub fn meta_fields(&self) -> &BTreeMap<String, Json> { &self.meta_fields }

    /// Canonical wrapped source `{"<type>": {...}}`.
    pub fn mapping_source(&self) -> &MappingSource { &self.source }

    /// Unwrapped body, as laid under new types when this is the default mapping.
    pub fn body(&self) -> Json { Self::body_json(&self.root, self.parent.as_deref(), &self.meta_fields) }

    pub fn to_metadata(&self) -> MappingMetadata { MappingMetadata::new(self.type_name.clone(), self.source.clone()) }

    pub(crate) fn parts(&self) -> (&ObjectField, Option<&String>, &BTreeMap<String, Json>) {
        (&self.root, self.parent.as_ref(), &self.meta_fields)
    }

    /// Every leaf field keyed by full dotted path, multi-fields included.
    pub fn leaves(&self) -> Vec<(String, &LeafField)> {
        fn walk_leaf<'a>(path: String, leaf: &'a LeafField, out: &mut Vec<(String, &'a LeafField)>) {
            for (sub, l) in &leaf.fields {
                walk_leaf(join(&path, sub), l, out);
            }
            out.push((path, leaf));
        }
        fn walk<'a>(path: &str, obj: &'a ObjectField, out: &mut Vec<(String, &'a LeafField)>) {
            for (name, f) in &obj.properties {
                let full = join(path, name);
                match f {
                    FieldMapping::Leaf(l) => walk_leaf(full, l, out),
                    FieldMapping::Object(o) => walk(&full, o, out),
                }
            }
        }
        let mut out = Vec::new();
        walk("", &self.root, &mut out);
        out
    }

    /// Look up a field by full dotted path.
    pub fn field(&self, path: &str) -> Option<&FieldMapping> {
        let mut segs = path.split('.');
        let mut cur = self.root.properties.get(segs.next()?)?;
        for seg in segs {
            cur = match cur {
                FieldMapping::Object(o) => o.properties.get(seg)?,
                FieldMapping::Leaf(_) => return None,
            };
        }
        Some(cur)
    }

    /// Copy of this mapper with `edit` applied to the leaf at `path`, or `None` when absent.
    pub(crate) fn with_leaf(&self, path: &str, edit: impl FnOnce(&mut LeafField)) -> Option<Self> {
        let segs: SmallVec<[&str; 8]> = path.split('.').collect();
        let mut root = self.root.clone();
        let leaf = leaf_mut(&mut root, &segs)?;
        edit(leaf);
        Some(Self::assemble(self.type_name.clone(), root, self.parent.clone(), self.meta_fields.clone()))
    }
}

fn leaf_mut<'a>(root: &'a mut ObjectField, segs: &[&str]) -> Option<&'a mut LeafField> {
    let (first, rest) = segs.split_first()?;
    match root.properties.get_mut(*first)? {
        FieldMapping::Object(o) => leaf_mut(o, rest),
        FieldMapping::Leaf(l) => {
            let mut cur = l;
            for seg in rest {
                cur = cur.fields.get_mut(*seg)?;
            }
            Some(cur)
        }
    }
}
