use crate::{errors::Error, image::Layer};
use std::{
    collections::HashSet,
    io::Read,
    path::{Component, Path, PathBuf},
};
use tar::{Archive, Builder, EntryType, Header};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

struct FlatEntry {
    header: Header,
    path: PathBuf,
    link: Option<PathBuf>,
    data: Vec<u8>,
}

/// Merge layers into one uncompressed tar of the resulting filesystem
///
/// Later layers win: a path present in several layers is taken from the last
/// one, and whiteout entries hide what lower layers put at their path.
/// Entries come out bottom layer first, in each layer's own order.
pub fn flatten(layers: &[Layer]) -> Result<Vec<u8>, Error> {
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut hidden: HashSet<PathBuf> = HashSet::new();
    let mut opaque: HashSet<PathBuf> = HashSet::new();
    let mut per_layer: Vec<Vec<FlatEntry>> = Vec::with_capacity(layers.len());

    for layer in layers.iter().rev() {
        let mut kept = Vec::new();
        let mut layer_hidden = Vec::new();
        let mut layer_opaque = Vec::new();
        let mut archive = Archive::new(layer.tar_reader());
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = match normalize(&entry.path()?) {
                Some(path) => path,
                None => continue,
            };
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
            if file_name == OPAQUE_WHITEOUT {
                layer_opaque.push(parent);
                continue;
            }
            if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                layer_hidden.push(parent.join(target));
                continue;
            }
            if seen.contains(&path) || is_hidden(&path, &hidden, &opaque) {
                continue;
            }
            seen.insert(path.clone());
            let link = entry.link_name()?.map(|link| link.into_owned());
            let mut data = Vec::new();
            if entry.header().entry_type() == EntryType::Regular {
                entry.read_to_end(&mut data)?;
            }
            kept.push(FlatEntry {
                header: entry.header().clone(),
                path,
                link,
                data,
            });
        }
        // Whiteouts only affect layers below the one that holds them
        hidden.extend(layer_hidden);
        opaque.extend(layer_opaque);
        per_layer.push(kept);
    }

    let mut builder = Builder::new(Vec::new());
    for entry in per_layer.into_iter().rev().flatten() {
        let mut header = entry.header;
        match entry.link {
            Some(link) => builder.append_link(&mut header, &entry.path, &link)?,
            None => builder.append_data(&mut header, &entry.path, &entry.data[..])?,
        }
    }
    Ok(builder.into_inner()?)
}

fn normalize(path: &Path) -> Option<PathBuf> {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => result.push(part),
            Component::ParentDir => return None,
            _ => (),
        }
    }
    if result.as_os_str().is_empty() {
        None
    } else {
        Some(result)
    }
}

fn is_hidden(path: &Path, hidden: &HashSet<PathBuf>, opaque: &HashSet<PathBuf>) -> bool {
    if hidden.contains(path) {
        return true;
    }
    path.ancestors()
        .skip(1)
        .any(|dir| hidden.contains(dir) || opaque.contains(dir))
}
