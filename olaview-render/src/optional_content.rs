//! Reading and rewriting a PDF's optional content configuration (`/OCProperties`).

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use lopdf::{Dictionary, Document, Object, ObjectId};
use olaview_core::{
    DeclaredLayer, DeclaredSection, LayerMetadata, OrderEntry, VisibilitySnapshot,
};

/// Layer ids are the OCG's indirect reference, written `"<obj> <gen>R"`.
pub fn layer_id(id: ObjectId) -> String {
    format!("{} {}R", id.0, id.1)
}

pub fn parse_layer_id(raw: &str) -> Option<ObjectId> {
    let (number, generation) = raw.strip_suffix('R')?.split_once(' ')?;
    Some((number.parse().ok()?, generation.parse().ok()?))
}

fn resolve<'a>(document: &'a Document, object: &'a Object) -> Result<&'a Object> {
    match object {
        Object::Reference(id) => document
            .get_object(*id)
            .map_err(|err| anyhow!("dangling reference {}: {err}", layer_id(*id))),
        other => Ok(other),
    }
}

fn resolve_dict<'a>(document: &'a Document, object: &'a Object) -> Result<&'a Dictionary> {
    resolve(document, object)?
        .as_dict()
        .map_err(|err| anyhow!("expected a dictionary: {err}"))
}

fn resolve_array<'a>(document: &'a Document, object: &'a Object) -> Result<&'a Vec<Object>> {
    resolve(document, object)?
        .as_array()
        .map_err(|err| anyhow!("expected an array: {err}"))
}

fn oc_properties(document: &Document) -> Result<Option<&Dictionary>> {
    let catalog = document.catalog().context("document has no catalog")?;
    match catalog.get(b"OCProperties") {
        Ok(object) => Ok(Some(resolve_dict(document, object)?)),
        Err(_) => Ok(None),
    }
}

/// PDF text strings are UTF-16BE when they carry a byte order mark.
fn decode_text(bytes: &[u8]) -> String {
    match bytes {
        [0xFE, 0xFF, rest @ ..] => {
            let units: Vec<u16> = rest
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn collect_references(document: &Document, items: &[Object], out: &mut Vec<String>) {
    for item in items {
        match item {
            Object::Reference(id) => out.push(layer_id(*id)),
            Object::Array(nested) => collect_references(document, nested, out),
            _ => {}
        }
    }
}

/// Extracts declared layers, their default visibility and the panel order.
///
/// A document without `/OCProperties` yields empty metadata. A configuration
/// without `/Order` lists every layer in a single untitled section.
pub fn read_layer_metadata(document: &Document) -> Result<LayerMetadata> {
    let Some(properties) = oc_properties(document)? else {
        return Ok(LayerMetadata::default());
    };

    let mut ocgs = Vec::new();
    if let Ok(object) = properties.get(b"OCGs") {
        for entry in resolve_array(document, object)? {
            if let Object::Reference(id) = entry {
                ocgs.push(*id);
            }
        }
    }

    let config = match properties.get(b"D") {
        Ok(object) => Some(resolve_dict(document, object)?),
        Err(_) => None,
    };
    let defaults = default_visibility(document, config, &ocgs)?;

    let mut layers = BTreeMap::new();
    for id in &ocgs {
        let name = document
            .get_object(*id)
            .and_then(Object::as_dict)
            .ok()
            .and_then(|group| group.get(b"Name").ok())
            .and_then(|name| name.as_str().ok())
            .map(decode_text);
        let key = layer_id(*id);
        let visible = defaults.get(&key).copied();
        layers.insert(key, DeclaredLayer { name, visible });
    }

    let order = match config.and_then(|config| config.get(b"Order").ok()) {
        Some(object) => read_order(document, resolve_array(document, object)?)?,
        None if ocgs.is_empty() => Vec::new(),
        None => vec![OrderEntry::Section(DeclaredSection {
            title: None,
            members: ocgs.iter().map(|id| layer_id(*id)).collect(),
        })],
    };

    Ok(LayerMetadata { order, layers })
}

fn default_visibility(
    document: &Document,
    config: Option<&Dictionary>,
    ocgs: &[ObjectId],
) -> Result<BTreeMap<String, bool>> {
    let base = config
        .and_then(|config| config.get(b"BaseState").ok())
        .and_then(|state| state.as_name().ok())
        .map(|state| state != b"OFF")
        .unwrap_or(true);

    let mut visibility: BTreeMap<String, bool> =
        ocgs.iter().map(|id| (layer_id(*id), base)).collect();

    if let Some(config) = config {
        for (key, visible) in [(&b"ON"[..], true), (&b"OFF"[..], false)] {
            let Ok(object) = config.get(key) else {
                continue;
            };
            for entry in resolve_array(document, object)? {
                if let Object::Reference(id) = entry {
                    visibility.insert(layer_id(*id), visible);
                }
            }
        }
    }
    Ok(visibility)
}

fn read_order(document: &Document, items: &[Object]) -> Result<Vec<OrderEntry>> {
    let mut order = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Object::Reference(id) => match document.get_object(*id) {
                Ok(Object::Array(nested)) => order.push(section(document, nested)),
                _ => order.push(OrderEntry::Layer(layer_id(*id))),
            },
            Object::Array(nested) => order.push(section(document, nested)),
            _ => {}
        }
    }
    Ok(order)
}

fn section(document: &Document, items: &[Object]) -> OrderEntry {
    let (title, rest) = match items.split_first() {
        Some((Object::String(label, _), rest)) => (Some(decode_text(label)), rest),
        _ => (None, items),
    };
    let mut members = Vec::new();
    collect_references(document, rest, &mut members);
    OrderEntry::Section(DeclaredSection { title, members })
}

/// Rewrites the default configuration so that exactly the layers visible in
/// `snapshot` are on. Layers absent from the snapshot keep their default.
pub fn apply_visibility(
    document: &mut Document,
    defaults: &LayerMetadata,
    snapshot: &VisibilitySnapshot,
) -> Result<()> {
    let (on, off): (Vec<_>, Vec<_>) = defaults
        .layers
        .iter()
        .filter_map(|(id, declared)| {
            let visible = snapshot
                .get(id)
                .unwrap_or_else(|| declared.visible.unwrap_or(true));
            Some((Object::Reference(parse_layer_id(id)?), visible))
        })
        .partition(|(_, visible)| *visible);

    let properties_location = {
        let catalog = document.catalog().context("document has no catalog")?;
        match catalog.get(b"OCProperties") {
            Ok(Object::Reference(id)) => Some(*id),
            Ok(_) => None,
            Err(_) => return Ok(()),
        }
    };

    let mut config = {
        let properties = oc_properties(document)?.context("optional content vanished")?;
        match properties.get(b"D") {
            Ok(object) => resolve_dict(document, object)?.clone(),
            Err(_) => Dictionary::new(),
        }
    };
    config.set("BaseState", Object::Name(b"ON".to_vec()));
    config.set("ON", Object::Array(on.into_iter().map(|(id, _)| id).collect()));
    config.set("OFF", Object::Array(off.into_iter().map(|(id, _)| id).collect()));
    // Usage application entries would override the ON/OFF arrays.
    config.remove(b"AS");
    let config_id = document.add_object(config);

    let properties = match properties_location {
        Some(id) => document.get_object_mut(id),
        None => {
            let root = document
                .trailer
                .get(b"Root")
                .and_then(Object::as_reference)
                .context("trailer has no /Root")?;
            document
                .get_object_mut(root)
                .and_then(Object::as_dict_mut)
                .and_then(|catalog| catalog.get_mut(b"OCProperties"))
        }
    }
    .and_then(Object::as_dict_mut)
    .map_err(|err| anyhow!("cannot update optional content properties: {err}"))?;
    properties.set("D", Object::Reference(config_id));
    Ok(())
}

/// True when `snapshot` renders exactly like the document's own defaults.
pub fn matches_defaults(defaults: &LayerMetadata, snapshot: &VisibilitySnapshot) -> bool {
    defaults.layers.iter().all(|(id, declared)| {
        snapshot
            .get(id)
            .map_or(true, |visible| visible == declared.visible.unwrap_or(true))
    })
}
