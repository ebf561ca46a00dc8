use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

/// A single typed field value inside a caps structure.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Fraction(i32, i32),
    IntRange { min: i64, max: i64 },
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn is_fixed(&self) -> bool {
        match self {
            FieldValue::IntRange { .. } => false,
            FieldValue::List(l) => l.len() == 1,
            _ => true,
        }
    }

    /// Intersection of two field values, or None when they are disjoint.
    pub fn intersect(&self, other: &FieldValue) -> Option<FieldValue> {
        use FieldValue::*;
        match (self, other) {
            (List(a), b) => {
                let hits: Vec<FieldValue> =
                    a.iter().filter_map(|v| v.intersect(b)).collect();
                match hits.len() {
                    0 => None,
                    1 => Some(hits.into_iter().next().unwrap()),
                    _ => Some(List(hits)),
                }
            }
            (a, List(_)) => other.intersect(a),
            (IntRange { min: a0, max: a1 }, IntRange { min: b0, max: b1 }) => {
                let min = (*a0).max(*b0);
                let max = (*a1).min(*b1);
                if min > max {
                    None
                } else if min == max {
                    Some(Int(min))
                } else {
                    Some(IntRange { min, max })
                }
            }
            (IntRange { min, max }, Int(v)) | (Int(v), IntRange { min, max }) => {
                if v >= min && v <= max { Some(Int(*v)) } else { None }
            }
            (a, b) => {
                if a == b { Some(a.clone()) } else { None }
            }
        }
    }

    /// True when every value admitted by `self` is admitted by `other`.
    pub fn is_subset(&self, other: &FieldValue) -> bool {
        use FieldValue::*;
        match (self, other) {
            (List(a), b) => a.iter().all(|v| v.is_subset(b)),
            (a, List(b)) => b.iter().any(|v| a.is_subset(v)),
            (Int(v), IntRange { min, max }) => v >= min && v <= max,
            (IntRange { min: a0, max: a1 }, IntRange { min: b0, max: b1 }) => {
                a0 >= b0 && a1 <= b1
            }
            (a, b) => a == b,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

/// A named media-type structure: `audio/mpeg, mpegversion=1, layer=3`.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    name: String,
    fields: BTreeMap<String, FieldValue>,
}

impl Structure {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn field(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn get_int(&self, field: &str) -> Option<i64> {
        match self.fields.get(field) {
            Some(FieldValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(FieldValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn is_fixed(&self) -> bool {
        self.fields.values().all(|v| v.is_fixed())
    }

    pub fn intersect(&self, other: &Structure) -> Option<Structure> {
        if self.name != other.name {
            return None;
        }
        let mut fields = BTreeMap::new();
        for (key, a) in &self.fields {
            match other.fields.get(key) {
                Some(b) => {
                    fields.insert(key.clone(), a.intersect(b)?);
                }
                None => {
                    fields.insert(key.clone(), a.clone());
                }
            }
        }
        for (key, b) in &other.fields {
            if !self.fields.contains_key(key) {
                fields.insert(key.clone(), b.clone());
            }
        }
        Some(Structure {
            name: self.name.clone(),
            fields,
        })
    }

    /// Subset test against a template structure: every field the template
    /// constrains must be present here and be a subset of the template's
    /// value.
    pub fn is_subset(&self, template: &Structure) -> bool {
        if self.name != template.name {
            return false;
        }
        template.fields.iter().all(|(key, tv)| {
            self.fields
                .get(key)
                .map(|v| v.is_subset(tv))
                .unwrap_or(false)
        })
    }
}

/// A capability descriptor: ANY, or an ordered list of structures.
/// An empty structure list is the EMPTY caps.
#[derive(Debug, Clone, PartialEq)]
pub struct Caps {
    any: bool,
    structures: Vec<Structure>,
}

impl Caps {
    pub fn new_any() -> Self {
        Self {
            any: true,
            structures: Vec::new(),
        }
    }

    pub fn new_empty() -> Self {
        Self {
            any: false,
            structures: Vec::new(),
        }
    }

    /// Caps with a single structure carrying only a media-type name.
    pub fn simple(name: impl Into<String>) -> Self {
        Structure::new(name).into()
    }

    pub fn from_structures(structures: Vec<Structure>) -> Self {
        Self {
            any: false,
            structures,
        }
    }

    pub fn is_any(&self) -> bool {
        self.any
    }

    pub fn is_empty(&self) -> bool {
        !self.any && self.structures.is_empty()
    }

    /// Fixed caps describe exactly one fully constrained format.
    pub fn is_fixed(&self) -> bool {
        !self.any && self.structures.len() == 1 && self.structures[0].is_fixed()
    }

    pub fn structures(&self) -> &[Structure] {
        &self.structures
    }

    pub fn structure(&self, index: usize) -> Option<&Structure> {
        self.structures.get(index)
    }

    /// Media-type name of the first structure.
    pub fn media_type(&self) -> Option<&str> {
        self.structures.first().map(|s| s.name())
    }

    pub fn equals(&self, other: &Caps) -> bool {
        self == other
    }

    pub fn intersect(&self, other: &Caps) -> Caps {
        if self.any {
            return other.clone();
        }
        if other.any {
            return self.clone();
        }
        let mut out = Vec::new();
        for a in &self.structures {
            for b in &other.structures {
                if let Some(s) = a.intersect(b) {
                    if !out.contains(&s) {
                        out.push(s);
                    }
                }
            }
        }
        Caps::from_structures(out)
    }

    pub fn can_intersect(&self, other: &Caps) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn is_subset(&self, superset: &Caps) -> bool {
        if superset.any {
            return true;
        }
        if self.any {
            return false;
        }
        self.structures.iter().all(|s| {
            superset
                .structures
                .iter()
                .any(|sup| s.is_subset(sup))
        })
    }

    /// Appends the structures of `other`, skipping duplicates.
    pub fn merge(&mut self, other: &Caps) {
        if self.any || other.is_empty() {
            return;
        }
        if other.any {
            self.any = true;
            self.structures.clear();
            return;
        }
        for s in &other.structures {
            if !self.structures.contains(s) {
                self.structures.push(s.clone());
            }
        }
    }
}

impl From<Structure> for Caps {
    fn from(s: Structure) -> Self {
        Caps::from_structures(vec![s])
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.any {
            return write!(f, "ANY");
        }
        if self.structures.is_empty() {
            return write!(f, "EMPTY");
        }
        let mut first_struct = true;
        for s in &self.structures {
            if !first_struct {
                write!(f, "; ")?;
            }
            first_struct = false;
            write!(f, "{}", s.name)?;
            for (key, value) in &s.fields {
                write!(f, ", {}={}", key, format_value(value))?;
            }
        }
        Ok(())
    }
}

fn format_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Int(v) => v.to_string(),
        FieldValue::Bool(v) => v.to_string(),
        FieldValue::Str(s) => format!("\"{}\"", s),
        FieldValue::Fraction(n, d) => format!("{}/{}", n, d),
        FieldValue::IntRange { min, max } => format!("[{}, {}]", min, max),
        FieldValue::List(l) => {
            let items: Vec<String> = l.iter().map(format_value).collect();
            format!("{{ {} }}", items.join(", "))
        }
    }
}

impl FromStr for Caps {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "EMPTY" {
            return Ok(Caps::new_empty());
        }
        if s == "ANY" {
            return Ok(Caps::new_any());
        }
        let mut structures = Vec::new();
        for part in s.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut tokens = split_fields(part);
            let name = tokens.remove(0);
            if !name.contains('/') {
                return Err(DecodeError::InvalidInput(format!(
                    "invalid media type: {}",
                    name
                )));
            }
            let mut structure = Structure::new(name);
            for token in tokens {
                let (key, raw) = token.split_once('=').ok_or_else(|| {
                    DecodeError::InvalidInput(format!("invalid caps field: {}", token))
                })?;
                structure.set(key.trim(), parse_value(raw.trim())?);
            }
            structures.push(structure);
        }
        Ok(Caps::from_structures(structures))
    }
}

/// Splits a structure description on commas that are not inside brackets.
fn split_fields(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in s.chars() {
        match c {
            '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn parse_value(raw: &str) -> Result<FieldValue, DecodeError> {
    if raw == "true" {
        return Ok(FieldValue::Bool(true));
    }
    if raw == "false" {
        return Ok(FieldValue::Bool(false));
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
        if parts.len() != 2 {
            return Err(DecodeError::InvalidInput(format!(
                "invalid range: {}",
                raw
            )));
        }
        let min = parts[0]
            .parse()
            .map_err(|_| DecodeError::InvalidInput(format!("invalid range: {}", raw)))?;
        let max = parts[1]
            .parse()
            .map_err(|_| DecodeError::InvalidInput(format!("invalid range: {}", raw)))?;
        return Ok(FieldValue::IntRange { min, max });
    }
    if let Some(inner) = raw.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        let mut items = Vec::new();
        for part in inner.split(',') {
            items.push(parse_value(part.trim())?);
        }
        return Ok(FieldValue::List(items));
    }
    if let Some(stripped) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return Ok(FieldValue::Str(stripped.to_string()));
    }
    if let Some((n, d)) = raw.split_once('/') {
        if let (Ok(n), Ok(d)) = (n.parse(), d.parse()) {
            return Ok(FieldValue::Fraction(n, d));
        }
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Ok(FieldValue::Int(v));
    }
    Ok(FieldValue::Str(raw.to_string()))
}

/// Coarse stream classification, in the stable order used when exposing
/// pads: raw video first, then encoded video, images, raw audio, encoded
/// audio, everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MediaCategory {
    VideoRaw,
    Video,
    Image,
    AudioRaw,
    Audio,
    Other,
}

impl MediaCategory {
    pub fn from_caps(caps: &Caps) -> Self {
        let name = match caps.media_type() {
            Some(n) => n,
            None => return MediaCategory::Other,
        };
        if name == "video/x-raw" {
            MediaCategory::VideoRaw
        } else if name.starts_with("video/") {
            MediaCategory::Video
        } else if name.starts_with("image/") {
            MediaCategory::Image
        } else if name == "audio/x-raw" {
            MediaCategory::AudioRaw
        } else if name.starts_with("audio/") {
            MediaCategory::Audio
        } else {
            MediaCategory::Other
        }
    }

    /// Loose match used when reusing output pads across group switches:
    /// both raw and encoded forms of a medium count as the same type.
    pub fn stream_type(&self) -> &'static str {
        match self {
            MediaCategory::VideoRaw | MediaCategory::Video | MediaCategory::Image => "video",
            MediaCategory::AudioRaw | MediaCategory::Audio => "audio",
            MediaCategory::Other => "other",
        }
    }
}

impl serde::Serialize for Caps {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Caps {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The default stop-set: fully decoded formats beyond which no further
/// plugging is attempted.
pub static DEFAULT_RAW_CAPS: Lazy<Caps> = Lazy::new(|| {
    Caps::from_structures(vec![
        Structure::new("video/x-raw"),
        Structure::new("audio/x-raw"),
        Structure::new("text/x-raw"),
        Structure::new("subpicture/x-dvd"),
    ])
});
