use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};

use crate::types::ProjectDescriptor;

/// Rewrite duplicate display prefixes using ancestor-folder disambiguation.
///
/// Projects are grouped by their current prefix; singleton groups are left
/// untouched. Within a group, each project picks the rarest not-yet-taken
/// ancestor segment of its id (nearest first) and becomes
/// `<segment>:<basename>`. Segments shared by every member of the group
/// (common roots, `package.json`) carry high occurrence counts and lose to
/// distinctive folder names.
///
/// When a project exhausts its segments the result degenerates to
/// `:<basename>`; global uniqueness is not guaranteed in that case.
pub fn deduplicate_prefixes(projects: &mut [ProjectDescriptor]) {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, project) in projects.iter().enumerate() {
        let members = groups.entry(project.prefix.clone()).or_insert_with(|| {
            order.push(project.prefix.clone());
            Vec::new()
        });
        members.push(index);
    }

    for prefix in order {
        let members = &groups[&prefix];
        if members.len() > 1 {
            disambiguate_group(projects, members);
        }
    }
}

/// Ancestor segments of an id, nearest first, excluding the basename (the
/// basename is already the base prefix).
fn ancestor_segments(id: &str) -> Vec<String> {
    let mut segments: Vec<String> = Path::new(id)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => part.to_str().map(str::to_owned),
            _ => None,
        })
        .collect();
    segments.reverse();
    if !segments.is_empty() {
        segments.remove(0);
    }
    segments
}

fn basename(id: &str) -> &str {
    Path::new(id)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(id)
}

fn disambiguate_group(projects: &mut [ProjectDescriptor], members: &[usize]) {
    let segment_lists: Vec<Vec<String>> = members
        .iter()
        .map(|&index| ancestor_segments(&projects[index].id))
        .collect();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for segments in &segment_lists {
        for segment in segments {
            *counts.entry(segment.as_str()).or_default() += 1;
        }
    }

    let mut taken: HashSet<String> = HashSet::new();
    for (position, &index) in members.iter().enumerate() {
        let mut best: Option<&str> = None;
        for segment in &segment_lists[position] {
            if taken.contains(segment.as_str()) {
                continue;
            }
            // Strict < keeps the first (nearest) segment on ties.
            match best {
                Some(current) if counts[segment.as_str()] >= counts[current] => {}
                _ => best = Some(segment.as_str()),
            }
        }

        let folder = best.unwrap_or("");
        if let Some(segment) = best {
            if let Some(count) = counts.get_mut(segment) {
                *count += 1;
            }
            taken.insert(segment.to_string());
        }
        let base = basename(&projects[index].id).to_string();
        projects[index].prefix = format!("{}:{}", folder, base);
    }
}
