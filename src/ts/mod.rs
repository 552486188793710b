// MPEG-TS alignment lookups.
//
// Pure functions over a read-only byte window. The consumer engine uses them
// to start a recording on a video PES boundary and to find cutover points
// when switching destinations. None of this is a demuxer; only the packet
// header and the first payload bytes are examined.

pub const TS_PACKET_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

const PAT_PID: u16 = 0x0000;
const NULL_PID: u16 = 0x1FFF;
/// PIDs below this are reserved for PSI tables.
const MIN_ES_PID: u16 = 0x0010;

/// Header fields of one transport packet, as far as alignment needs them.
struct PacketHeader {
    pid: u16,
    payload_unit_start: bool,
    adaptation_field: bool,
    has_payload: bool,
}

fn parse_header(packet: &[u8]) -> Option<PacketHeader> {
    if packet.len() < 4 || packet[0] != TS_SYNC_BYTE {
        return None;
    }
    // transport_error_indicator set means the packet cannot be trusted
    if packet[1] & 0x80 != 0 {
        return None;
    }
    let afc = (packet[3] >> 4) & 0x03;
    Some(PacketHeader {
        pid: u16::from(packet[1] & 0x1F) << 8 | u16::from(packet[2]),
        payload_unit_start: packet[1] & 0x40 != 0,
        adaptation_field: afc & 0x02 != 0,
        has_payload: afc & 0x01 != 0,
    })
}

/// Byte offset of the packet payload, past any adaptation field.
/// `None` when the adaptation field is malformed or fills the packet.
fn payload_offset(packet: &[u8], header: &PacketHeader) -> Option<usize> {
    if !header.has_payload {
        return None;
    }
    let mut offset = 4;
    if header.adaptation_field {
        let af_len = *packet.get(4)? as usize;
        offset += 1 + af_len;
    }
    if offset >= TS_PACKET_SIZE {
        return None;
    }
    Some(offset)
}

/// Treats `window[i..]` as a candidate packet start. A candidate is rejected
/// when the window is long enough to check the next sync byte and it is
/// absent; windows ending mid-packet simply never match.
fn sync_plausible(window: &[u8], i: usize) -> bool {
    window[i] == TS_SYNC_BYTE
        && window
            .get(i + TS_PACKET_SIZE)
            .map_or(true, |&b| b == TS_SYNC_BYTE)
}

/// Finds the first packet that begins a video PES.
///
/// With `video_pid = None` (initial lock-on) any elementary-stream PID is
/// accepted; once the caller knows the video PID it should pass it so audio
/// PES starts are not mistaken for cutover points. Returns the byte offset of
/// the packet's sync byte, or `None` when the window holds no match.
pub fn find_video_pes_start(window: &[u8], video_pid: Option<u16>) -> Option<usize> {
    for i in 0..window.len() {
        if !sync_plausible(window, i) {
            continue;
        }
        let Some(header) = parse_header(&window[i..]) else {
            continue;
        };
        if !header.payload_unit_start {
            continue;
        }
        match video_pid {
            Some(pid) if header.pid != pid => continue,
            None if header.pid < MIN_ES_PID || header.pid == NULL_PID => continue,
            _ => {}
        }
        let Some(offset) = payload_offset(&window[i..], &header) else {
            continue;
        };
        let payload = &window[i + offset..];
        if payload.len() < 4 || window.len() - i < offset + 4 {
            continue;
        }
        if payload[0] == 0x00
            && payload[1] == 0x00
            && payload[2] == 0x01
            && (0xE0..=0xEF).contains(&payload[3])
        {
            return Some(i);
        }
    }
    None
}

/// Finds the first packet starting a PAT section (PID 0, unit start set).
pub fn find_pat_start(window: &[u8]) -> Option<usize> {
    for i in 0..window.len() {
        if !sync_plausible(window, i) {
            continue;
        }
        let Some(header) = parse_header(&window[i..]) else {
            continue;
        };
        if header.pid == PAT_PID && header.payload_unit_start && header.has_payload {
            return Some(i);
        }
    }
    None
}

/// Finds the first packet whose adaptation field carries the
/// random-access-indicator bit. `video_pid` restricts the search to one PID.
pub fn find_random_access(window: &[u8], video_pid: Option<u16>) -> Option<usize> {
    for i in 0..window.len() {
        if !sync_plausible(window, i) {
            continue;
        }
        let Some(header) = parse_header(&window[i..]) else {
            continue;
        };
        if !header.adaptation_field {
            continue;
        }
        if let Some(pid) = video_pid {
            if header.pid != pid {
                continue;
            }
        }
        let packet = &window[i..];
        let Some(&af_len) = packet.get(4) else {
            continue;
        };
        if af_len == 0 {
            continue;
        }
        let Some(&flags) = packet.get(5) else {
            continue;
        };
        if flags & 0x40 != 0 {
            return Some(i);
        }
    }
    None
}

/// PID of the packet starting at `packet[0]`, if it parses.
pub fn packet_pid(packet: &[u8]) -> Option<u16> {
    parse_header(packet).map(|h| h.pid)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthetic transport-stream packets for the alignment and engine tests.

    use super::TS_PACKET_SIZE;

    /// Packet carrying the start of a video PES on `pid`.
    pub fn pes_start_packet(pid: u16) -> Vec<u8> {
        let mut p = vec![0xFFu8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[1] = 0x40 | (pid >> 8) as u8;
        p[2] = (pid & 0xFF) as u8;
        p[3] = 0x10; // payload only
        p[4] = 0x00;
        p[5] = 0x00;
        p[6] = 0x01;
        p[7] = 0xE0;
        p
    }

    /// Continuation packet (no unit start) on `pid`.
    pub fn filler_packet(pid: u16) -> Vec<u8> {
        let mut p = vec![0xAAu8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[1] = (pid >> 8) as u8;
        p[2] = (pid & 0xFF) as u8;
        p[3] = 0x10;
        p
    }

    /// PAT packet (PID 0, unit start).
    pub fn pat_packet() -> Vec<u8> {
        let mut p = vec![0x00u8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[1] = 0x40;
        p[2] = 0x00;
        p[3] = 0x10;
        p
    }

    /// Packet with an adaptation field whose random-access bit is set.
    pub fn random_access_packet(pid: u16) -> Vec<u8> {
        let mut p = vec![0xFFu8; TS_PACKET_SIZE];
        p[0] = 0x47;
        p[1] = (pid >> 8) as u8;
        p[2] = (pid & 0xFF) as u8;
        p[3] = 0x30; // adaptation field + payload
        p[4] = 0x07; // adaptation field length
        p[5] = 0x40; // random_access_indicator
        p
    }
}
