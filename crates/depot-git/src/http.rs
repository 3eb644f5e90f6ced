//! Git smart HTTP protocol handlers (protocol v0, stateless RPC)
//!
//! Implements:
//! - GET  /info/refs?service=git-upload-pack
//! - GET  /info/refs?service=git-receive-pack
//! - POST /git-upload-pack
//! - POST /git-receive-pack
//!
//! Handlers take the whole request body and return the whole response
//! body; the HTTP layer only deals with routing, auth and headers.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::locks::RefLocks;
use crate::object::{ObjectId, ObjectType, Tag};
use crate::pack::{generate_packfile, parse_packfile, PackBuilder};
use crate::protocol::*;
use crate::refs::{validate_update_ref_name, Ref, HEAD, REFS_TAGS};
use crate::storage::GitStorage;
use crate::{Error, Result};

/// Service types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "git-upload-pack" => Some(Service::UploadPack),
            "git-receive-pack" => Some(Service::ReceivePack),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::UploadPack => "git-upload-pack",
            Service::ReceivePack => "git-receive-pack",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-advertisement",
            Service::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    pub fn result_content_type(&self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-result",
            Service::ReceivePack => "application/x-git-receive-pack-result",
        }
    }
}

const MAX_PEEL_DEPTH: usize = 10;

/// Handle GET /info/refs?service=git-upload-pack or git-receive-pack
pub async fn handle_info_refs(storage: &GitStorage, service: Service) -> Result<(String, Vec<u8>)> {
    let mut writer = PktLineWriter::new();

    writer.write_str(&format!("# service={}", service.as_str()));
    writer.flush();

    let mut advertised: Vec<(ObjectId, String)> = Vec::new();
    let mut symref = None;

    // receive-pack clients never update HEAD, so it is only offered for fetch
    if service == Service::UploadPack {
        match storage.resolve_ref(HEAD).await {
            Ok(oid) => {
                advertised.push((oid, HEAD.to_string()));
                symref = storage.head_target().await?;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }

    for named in storage.list_refs().await? {
        let oid = match &named.reference {
            Ref::Direct(oid) => *oid,
            Ref::Symbolic(_) => match storage.resolve_ref(&named.name).await {
                Ok(oid) => oid,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            },
        };
        advertised.push((oid, named.name));
    }

    let peeled = peel_tags(storage, &advertised).await?;

    let caps = match service {
        Service::UploadPack => format_capabilities(UPLOAD_PACK_CAPABILITIES, symref.as_deref()),
        Service::ReceivePack => format_capabilities(RECEIVE_PACK_CAPABILITIES, None),
    };

    if advertised.is_empty() {
        writer.write_str(&format!("{} capabilities^{{}}\0{}", ObjectId::ZERO, caps));
    }

    for (i, (oid, name)) in advertised.iter().enumerate() {
        if i == 0 {
            writer.write_str(&format!("{} {}\0{}", oid, name, caps));
        } else {
            writer.write_str(&format!("{} {}", oid, name));
        }
        if let Some(target) = peeled.get(i).copied().flatten() {
            writer.write_str(&format!("{} {}^{{}}", target, name));
        }
    }

    writer.flush();
    debug!("advertised {} refs for {}", advertised.len(), service.as_str());
    Ok((service.content_type().to_string(), writer.into_bytes()))
}

/// Peeled targets of annotated tags, parallel to `refs`
async fn peel_tags(
    storage: &GitStorage,
    refs: &[(ObjectId, String)],
) -> Result<Vec<Option<ObjectId>>> {
    let tag_oids: Vec<ObjectId> = refs
        .iter()
        .filter(|(_, name)| name.starts_with(REFS_TAGS))
        .map(|(oid, _)| *oid)
        .collect();
    if tag_oids.is_empty() {
        return Ok(vec![None; refs.len()]);
    }

    let objects = storage.read_objects(&tag_oids).await?;
    let mut peeled = Vec::with_capacity(refs.len());

    for (oid, name) in refs {
        let tag = match objects.get(oid) {
            Some(obj) if name.starts_with(REFS_TAGS) && obj.obj_type == ObjectType::Tag => {
                Tag::parse(&obj.content)?
            }
            _ => {
                peeled.push(None);
                continue;
            }
        };

        // Tags of tags peel down to the first non-tag object
        let mut target = tag.object;
        let mut target_type = tag.target_type;
        for _ in 0..MAX_PEEL_DEPTH {
            if target_type != ObjectType::Tag {
                break;
            }
            let inner = Tag::parse(&storage.read_object(&target).await?.content)?;
            target = inner.object;
            target_type = inner.target_type;
        }
        peeled.push(Some(target));
    }

    Ok(peeled)
}

/// How the client wants ACKs during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckMode {
    Single,
    Multi,
    Detailed,
}

impl AckMode {
    fn from_caps(caps: &Capabilities) -> Self {
        if caps.has("multi_ack_detailed") {
            AckMode::Detailed
        } else if caps.has("multi_ack") {
            AckMode::Multi
        } else {
            AckMode::Single
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Negotiation {
    Have(ObjectId),
    Flush,
    Done,
}

/// A parsed upload-pack request
#[derive(Debug, Default)]
struct UploadRequest {
    wants: Vec<ObjectId>,
    caps: Capabilities,
    negotiation: Vec<Negotiation>,
}

impl UploadRequest {
    fn parse(body: &[u8]) -> Result<Self> {
        let mut reader = PktLineReader::new(body);
        let mut request = UploadRequest::default();

        for data in reader.read_until_flush()? {
            let line = utf8_line(data)?;
            if let Some(rest) = line.strip_prefix("want ") {
                let (hex, caps) = rest.split_once(' ').unwrap_or((rest, ""));
                if request.wants.is_empty() {
                    request.caps = Capabilities::parse(caps);
                }
                request.wants.push(parse_oid(hex)?);
            } else if line.starts_with("shallow ") || line.starts_with("deepen") {
                // Shallow clones are not advertised
                continue;
            } else {
                return Err(Error::ProtocolError(format!("unexpected line: {}", line)));
            }
        }

        while let Some(pkt) = reader.read()? {
            match pkt {
                PktLine::Flush => request.negotiation.push(Negotiation::Flush),
                PktLine::Data(data) => {
                    let line = utf8_line(data)?;
                    if let Some(hex) = line.strip_prefix("have ") {
                        request.negotiation.push(Negotiation::Have(parse_oid(hex.trim())?));
                    } else if line == "done" {
                        request.negotiation.push(Negotiation::Done);
                        break;
                    } else {
                        return Err(Error::ProtocolError(format!("unexpected line: {}", line)));
                    }
                }
                _ => {}
            }
        }

        Ok(request)
    }

    fn haves(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.negotiation.iter().filter_map(|n| match n {
            Negotiation::Have(oid) => Some(*oid),
            _ => None,
        })
    }
}

/// Handle POST /git-upload-pack (client wants to fetch)
///
/// Each request is one negotiation round. A round ending in a flush gets
/// ACK/NAK lines only; a round ending in `done` also gets the packfile.
pub async fn handle_upload_pack(storage: &GitStorage, body: &[u8]) -> Result<Vec<u8>> {
    let request = UploadRequest::parse(body)?;
    let mut response = PktLineWriter::new();

    if request.wants.is_empty() {
        response.write_str("NAK");
        response.flush();
        return Ok(response.into_bytes());
    }

    let mut lookup = request.wants.clone();
    lookup.extend(request.haves());
    let known: HashSet<ObjectId> = storage.read_objects(&lookup).await?.into_keys().collect();

    if let Some(missing) = request.wants.iter().find(|oid| !known.contains(oid)) {
        warn!("upload-pack: want {} is not an object of this repository", missing);
        response.write_str(&format!("ERR upload-pack: not our ref {}", missing));
        return Ok(response.into_bytes());
    }

    let mode = AckMode::from_caps(&request.caps);
    let mut common: Vec<ObjectId> = Vec::new();
    let mut got_other = false;
    let mut done = false;

    for step in &request.negotiation {
        match *step {
            Negotiation::Have(oid) if known.contains(&oid) => {
                if common.contains(&oid) {
                    continue;
                }
                common.push(oid);
                match mode {
                    AckMode::Detailed => response.write_str(&format!("ACK {} common", oid)),
                    AckMode::Multi => response.write_str(&format!("ACK {} continue", oid)),
                    AckMode::Single if common.len() == 1 => {
                        response.write_str(&format!("ACK {}", oid))
                    }
                    AckMode::Single => {}
                }
            }
            Negotiation::Have(_) => got_other = true,
            Negotiation::Flush => break,
            Negotiation::Done => {
                done = true;
                break;
            }
        }
    }

    if !done {
        if let (AckMode::Detailed, Some(last), false) = (mode, common.last(), got_other) {
            response.write_str(&format!("ACK {} ready", last));
        }
        if common.is_empty() || mode != AckMode::Single {
            response.write_str("NAK");
        }
        debug!("upload-pack round: {} common, {} wants", common.len(), request.wants.len());
        return Ok(response.into_bytes());
    }

    match common.last() {
        None => response.write_str("NAK"),
        Some(last) if mode != AckMode::Single => response.write_str(&format!("ACK {}", last)),
        Some(_) => {}
    }

    let mut builder = PackBuilder::new(storage);
    for oid in &request.wants {
        builder.want(*oid);
    }
    for oid in &common {
        builder.have(*oid);
    }
    let oids = builder.object_ids().await?;
    let object_count = oids.len();
    let pack = generate_packfile(storage, &oids).await?;

    let sideband = request.caps.sideband();
    if !request.caps.has("no-progress") {
        let progress = format!("Counting objects: {}, done.\n", object_count);
        response.write_band(sideband, sideband::PROGRESS, progress.as_bytes());
    }
    response.write_band(sideband, sideband::DATA, &pack);
    if sideband != Sideband::None {
        response.flush();
    }

    info!(
        "upload-pack: sent {} objects ({} bytes) for {} wants, {} common",
        object_count,
        pack.len(),
        request.wants.len(),
        common.len()
    );
    Ok(response.into_bytes())
}

/// One `<old> <new> <ref>` line of a push
#[derive(Debug, Clone, PartialEq, Eq)]
struct RefCommand {
    old: ObjectId,
    new: ObjectId,
    name: String,
}

impl RefCommand {
    fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(3, ' ');
        let (Some(old), Some(new), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::ProtocolError(format!("invalid command: {}", line)));
        };
        Ok(Self {
            old: parse_oid(old)?,
            new: parse_oid(new)?,
            name: name.to_string(),
        })
    }

    fn expected(&self) -> Option<&ObjectId> {
        (!self.old.is_zero()).then_some(&self.old)
    }

    fn new_value(&self) -> Option<&ObjectId> {
        (!self.new.is_zero()).then_some(&self.new)
    }

    /// Checks that need no ref state
    fn check(&self, present: &HashSet<ObjectId>) -> std::result::Result<(), String> {
        if validate_update_ref_name(&self.name).is_err() {
            return Err("funny refname".into());
        }
        match self.new_value() {
            Some(oid) if !present.contains(oid) => Err("missing necessary objects".into()),
            _ => Ok(()),
        }
    }
}

type CommandResult = std::result::Result<(), String>;

/// Handle POST /git-receive-pack (client wants to push)
///
/// Objects are stored first; each ref then moves only if it still holds
/// the old value the client sent. With `atomic`, either every ref moves
/// or none do. `repo` names the lock taken around the ref updates.
pub async fn handle_receive_pack(
    storage: &GitStorage,
    locks: &RefLocks,
    repo: &str,
    body: &[u8],
) -> Result<Vec<u8>> {
    let mut reader = PktLineReader::new(body);
    let mut commands = Vec::new();
    let mut caps = Capabilities::default();

    loop {
        match reader.read()? {
            None | Some(PktLine::Flush) => break,
            Some(PktLine::Data(data)) => {
                let line = utf8_line(data)?;
                let (line, line_caps) = match line.split_once('\0') {
                    Some((cmd, c)) => (cmd, Some(c)),
                    None => (line, None),
                };
                if let (Some(c), true) = (line_caps, commands.is_empty()) {
                    caps = Capabilities::parse(c);
                }
                if line.starts_with("shallow ") {
                    continue;
                }
                commands.push(RefCommand::parse(line)?);
            }
            Some(_) => {}
        }
    }

    if commands.is_empty() {
        return Ok(Vec::new());
    }

    let pack = reader.remaining();
    let unpacked: std::result::Result<usize, String> = if pack.is_empty() {
        Ok(0)
    } else {
        match parse_packfile(storage, pack).await {
            Ok(oids) => Ok(oids.len()),
            Err(e) => {
                warn!("receive-pack: unpack failed: {}", e);
                Err(e.to_string().replace('\n', " "))
            }
        }
    };

    let results = match &unpacked {
        Ok(_) => update_refs(storage, locks, repo, &commands, caps.has("atomic")).await?,
        Err(_) => vec![Err("unpacker error".to_string()); commands.len()],
    };

    let updated = results.iter().filter(|r| r.is_ok()).count();
    info!(
        "receive-pack {}: {} objects, {}/{} refs updated",
        repo,
        unpacked.as_ref().copied().unwrap_or(0),
        updated,
        commands.len()
    );

    if !caps.has("report-status") {
        return Ok(Vec::new());
    }

    let mut report = PktLineWriter::new();
    match &unpacked {
        Ok(_) => report.write_str("unpack ok"),
        Err(e) => report.write_str(&format!("unpack {}", e)),
    }
    for (cmd, result) in commands.iter().zip(&results) {
        match result {
            Ok(()) => report.write_str(&format!("ok {}", cmd.name)),
            Err(reason) => report.write_str(&format!("ng {} {}", cmd.name, reason)),
        }
    }
    report.flush();

    let sideband = caps.sideband();
    if sideband == Sideband::None {
        return Ok(report.into_bytes());
    }

    let mut response = PktLineWriter::new();
    response.write_band(sideband, sideband::DATA, report.as_bytes());
    response.flush();
    Ok(response.into_bytes())
}

async fn update_refs(
    storage: &GitStorage,
    locks: &RefLocks,
    repo: &str,
    commands: &[RefCommand],
    atomic: bool,
) -> Result<Vec<CommandResult>> {
    let needed: Vec<ObjectId> = commands.iter().filter_map(|c| c.new_value().copied()).collect();
    let present: HashSet<ObjectId> = storage.read_objects(&needed).await?.into_keys().collect();

    let mut results: Vec<CommandResult> = commands.iter().map(|c| c.check(&present)).collect();

    let _guard = locks.lock(repo).await;

    if !atomic {
        for (cmd, result) in commands.iter().zip(results.iter_mut()) {
            if result.is_err() {
                continue;
            }
            *result = match storage
                .compare_and_swap_ref(&cmd.name, cmd.expected(), cmd.new_value())
                .await
            {
                Ok(true) => Ok(()),
                Ok(false) => Err("failed to update ref".into()),
                Err(e) => Err(e.to_string()),
            };
        }
        return Ok(results);
    }

    // Check every ref before moving any of them
    for (cmd, result) in commands.iter().zip(results.iter_mut()) {
        if result.is_ok() && current_ref(storage, &cmd.name).await?.as_ref() != cmd.expected() {
            *result = Err("failed to update ref".into());
        }
    }
    if results.iter().any(CommandResult::is_err) {
        fail_remaining(&mut results);
        return Ok(results);
    }

    let mut applied: Vec<&RefCommand> = Vec::new();
    for cmd in commands {
        let moved = storage
            .compare_and_swap_ref(&cmd.name, cmd.expected(), cmd.new_value())
            .await;
        match moved {
            Ok(true) => applied.push(cmd),
            Ok(false) | Err(_) => {
                warn!("atomic push to {} failed at {}, rolling back", repo, cmd.name);
                for done in applied.iter().rev() {
                    storage
                        .compare_and_swap_ref(&done.name, done.new_value(), done.expected())
                        .await?;
                }
                return Ok(vec![Err("atomic push failed".into()); commands.len()]);
            }
        }
    }

    Ok(results)
}

fn fail_remaining(results: &mut [CommandResult]) {
    for result in results.iter_mut().filter(|r| r.is_ok()) {
        *result = Err("atomic push failed".into());
    }
}

/// Current direct value of a ref, bypassing cached reads
async fn current_ref(storage: &GitStorage, name: &str) -> Result<Option<ObjectId>> {
    storage.fs().invalidate(name);
    storage.fs().invalidate("packed-refs");
    match storage.read_ref(name).await {
        Ok(Ref::Direct(oid)) => Ok(Some(oid)),
        Ok(Ref::Symbolic(_)) => Err(Error::InvalidRefName(format!("{} is a symbolic ref", name))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn utf8_line(data: &[u8]) -> Result<&str> {
    std::str::from_utf8(trim_line(data)).map_err(|_| Error::ProtocolError("invalid utf8".into()))
}

fn parse_oid(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex).ok_or_else(|| Error::ProtocolError(format!("invalid object id: {}", hex)))
}
