//! Custom XMPP stanza payloads, per the wire protocol table in section 6.
//!
//! `xmpp-parsers` supplies `Jid` and the standard IQ/pub-sub/bytestream
//! element vocabulary; none of the XEPs it implements cover baboon's own
//! payload kinds (`git-init`, `rsync`, `rsyncfinished`, `merge_verification`,
//! `merge_status`), so those are built and parsed directly as `Element`s in
//! one namespace, mirroring how the original's `common/stanza/rsync.py`
//! defines a dedicated stanza class per payload kind.

use xmpp_parsers::minidom::Element;

use crate::error::{BaboonError, Result};
use crate::event::{EventKind, FileEvent};

pub const NS: &str = "baboon:protocol";

pub fn git_init(node: &str, url: &str) -> Element {
    Element::builder("git-init", NS)
        .attr("node", node)
        .attr("url", url)
        .build()
}

pub fn parse_git_init(el: &Element) -> Result<(String, String)> {
    let node = attr(el, "node")?;
    let url = attr(el, "url")?;
    Ok((node, url))
}

/// Builds one `rsync` stanza carrying a contiguous slice of events for one
/// (sid, rid, project). Callers split oversized batches with
/// `wire::split_events` before calling this once per chunk; `chunks` is the
/// total number of stanzas the batch was split into (1 for an unsplit
/// batch), carried on every chunk so the daemon knows when it has seen them
/// all and can reassemble the batch before enqueuing a single `Task::Sync`.
pub fn rsync(sid: &str, rid: &str, node: &str, events: &[FileEvent], chunks: usize) -> Element {
    let mut builder = Element::builder("rsync", NS)
        .attr("sid", sid)
        .attr("rid", rid)
        .attr("node", node)
        .attr("chunks", chunks.to_string());

    for event in events {
        let child = match event.kind {
            EventKind::Create => Element::builder("create_file", NS).append(event.src_path.as_str()).build(),
            EventKind::Modify => Element::builder("file", NS).append(event.src_path.as_str()).build(),
            EventKind::Delete => Element::builder("delete_file", NS).append(event.src_path.as_str()).build(),
            EventKind::Move => Element::builder("move_file", NS)
                .attr("dest", event.dest_path.clone().unwrap_or_default())
                .append(event.src_path.as_str())
                .build(),
        };
        builder = builder.append(child);
    }
    builder.build()
}

pub fn parse_rsync(el: &Element) -> Result<(String, String, String, usize, Vec<FileEvent>)> {
    let sid = attr(el, "sid")?;
    let rid = attr(el, "rid")?;
    let node = attr(el, "node")?;
    let chunks: usize = attr(el, "chunks")?
        .parse()
        .map_err(|_| BaboonError::Internal("rsync stanza has a non-numeric 'chunks' attribute".into()))?;

    let mut events = Vec::new();
    for child in el.children() {
        let src = child.text();
        match child.name() {
            "create_file" => events.push(FileEvent::create(&node, src)),
            "file" => events.push(FileEvent::modify(&node, src)),
            "delete_file" => events.push(FileEvent::delete(&node, src)),
            "move_file" => {
                let dest = child.attr("dest").unwrap_or_default().to_string();
                events.push(FileEvent::moved(&node, src, dest));
            }
            _ => {}
        }
    }
    Ok((sid, rid, node, chunks, events))
}

pub fn rsync_finished(node: &str) -> Element {
    Element::builder("rsyncfinished", NS).attr("node", node).build()
}

pub fn merge_verification(node: &str) -> Element {
    Element::builder("merge_verification", NS).attr("node", node).build()
}

pub fn parse_node_only(el: &Element) -> Result<String> {
    attr(el, "node")
}

pub fn merge_status(node: &str, status: &str, files: &[String]) -> Element {
    let mut builder = Element::builder("merge_status", NS).attr("node", node).attr("status", status);
    for file in files {
        builder = builder.append(Element::builder("file", NS).append(file.as_str()).build());
    }
    builder.build()
}

pub fn parse_merge_status(el: &Element) -> Result<(String, String, Vec<String>)> {
    let node = attr(el, "node")?;
    let status = attr(el, "status")?;
    let files = el
        .children()
        .filter(|c| c.name() == "file")
        .map(|c| c.text())
        .collect();
    Ok((node, status, files))
}

fn attr(el: &Element, name: &str) -> Result<String> {
    el.attr(name)
        .map(|v| v.to_string())
        .ok_or_else(|| BaboonError::Internal(format!("stanza missing required attribute '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsync_round_trips_mixed_event_kinds() {
        let events = vec![
            FileEvent::create("p", "a.txt"),
            FileEvent::modify("p", "b.txt"),
            FileEvent::delete("p", "c.txt"),
            FileEvent::moved("p", "d.txt", "e.txt"),
        ];
        let el = rsync("sid-1", "rid-1", "p", &events, 1);
        let (sid, rid, node, chunks, parsed) = parse_rsync(&el).unwrap();
        assert_eq!(sid, "sid-1");
        assert_eq!(rid, "rid-1");
        assert_eq!(node, "p");
        assert_eq!(chunks, 1);
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed[3].dest_path.as_deref(), Some("e.txt"));
    }

    #[test]
    fn merge_status_round_trips_conflict_files() {
        let el = merge_status("proj", "conflict", &["a.txt".into(), "b.txt".into()]);
        let (node, status, files) = parse_merge_status(&el).unwrap();
        assert_eq!(node, "proj");
        assert_eq!(status, "conflict");
        assert_eq!(files, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[test]
    fn git_init_round_trips() {
        let el = git_init("proj", "git@example.com:proj.git");
        let (node, url) = parse_git_init(&el).unwrap();
        assert_eq!(node, "proj");
        assert_eq!(url, "git@example.com:proj.git");
    }
}
