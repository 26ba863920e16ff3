//! Wire-protocol constants shared with chunk servers, metaloggers and
//! supervisors. The numeric values are part of the on-wire contract and must
//! not change.

pub mod framing;
pub mod wire;

// Generic messages understood by every listener.
pub const ANTOAN_NOP: u32 = 0;
pub const ANTOAN_UNKNOWN_COMMAND: u32 = 1;
pub const ANTOAN_BAD_COMMAND_SIZE: u32 = 2;
pub const ANTOAN_GET_VERSION: u32 = 10;
pub const ANTOAN_VERSION: u32 = 11;
pub const ANTOAN_GET_CONFIG: u32 = 12;
pub const ANTOAN_CONFIG_VALUE: u32 = 13;
pub const ANTOAN_FORCE_TIMEOUT: u32 = 16;

// Metalogger / supervisor port.
pub const ANTOMA_REGISTER: u32 = 50;
pub const MATOAN_METACHANGES_LOG: u32 = 51;
pub const MATOAN_MASTER_ACK: u32 = 55;
pub const MATOAN_STATE: u32 = 56;
pub const ANTOMA_STORE_METADATA: u32 = 57;
pub const ANTOMA_DOWNLOAD_START: u32 = 60;
pub const MATOAN_DOWNLOAD_INFO: u32 = 61;
pub const ANTOMA_DOWNLOAD_REQUEST: u32 = 62;
pub const MATOAN_DOWNLOAD_DATA: u32 = 63;
pub const ANTOMA_DOWNLOAD_END: u32 = 64;

// Chunkserver port.
pub const CSTOMA_REGISTER: u32 = 100;
pub const CSTOMA_SPACE: u32 = 101;
pub const CSTOMA_CHUNK_DAMAGED: u32 = 102;
pub const CSTOMA_CHUNK_LOST: u32 = 103;
pub const CSTOMA_ERROR_OCCURRED: u32 = 104;
pub const CSTOMA_CHUNK_NEW: u32 = 105;
pub const MATOCS_CREATE: u32 = 106;
pub const CSTOMA_CREATE: u32 = 107;
pub const MATOCS_DELETE: u32 = 108;
pub const CSTOMA_DELETE: u32 = 109;
pub const MATOCS_DUPLICATE: u32 = 110;
pub const CSTOMA_DUPLICATE: u32 = 111;
pub const MATOCS_SET_VERSION: u32 = 112;
pub const CSTOMA_SET_VERSION: u32 = 113;
pub const MATOCS_REPLICATE: u32 = 114;
pub const CSTOMA_REPLICATE: u32 = 115;
pub const MATOCS_CHUNKOP: u32 = 116;
pub const CSTOMA_CHUNKOP: u32 = 117;
pub const MATOCS_TRUNCATE: u32 = 118;
pub const CSTOMA_TRUNCATE: u32 = 119;
pub const MATOCS_DUPTRUNC: u32 = 120;
pub const CSTOMA_DUPTRUNC: u32 = 121;
pub const CSTOMA_LABELS: u32 = 122;
pub const CSTOMA_CURRENT_LOAD: u32 = 123;
pub const MATOCS_MASTER_ACK: u32 = 124;
pub const CSTOMA_CHUNK_DOESNT_EXIST: u32 = 125;
pub const MATOCS_REPLICATE_SPLIT: u32 = 126;
pub const CSTOMA_REPLICATE_SPLIT: u32 = 127;
pub const MATOCS_REPLICATE_RECOVER: u32 = 128;
pub const CSTOMA_REPLICATE_RECOVER: u32 = 129;
pub const MATOCS_REPLICATE_JOIN: u32 = 130;
pub const CSTOMA_REPLICATE_JOIN: u32 = 131;
pub const MATOCS_LOCALSPLIT: u32 = 132;
pub const CSTOMA_LOCALSPLIT: u32 = 133;
pub const MATOCS_CHUNK_STATUS: u32 = 134;
pub const CSTOMA_CHUNK_STATUS: u32 = 135;
pub const MATOCS_REGISTER_FIRST: u32 = 136;

// Status bytes carried in reply packets.
pub const STATUS_OK: u8 = 0;
pub const ERROR_ENOENT: u8 = 3;
pub const ERROR_EACCES: u8 = 4;
pub const ERROR_EEXIST: u8 = 5;
pub const ERROR_EINVAL: u8 = 6;
pub const ERROR_IO: u8 = 22;
pub const ERROR_MISMATCH: u8 = 35;
pub const ERROR_NOTFOUND: u8 = 36;
pub const ERROR_ACTIVE: u8 = 37;

/// Heavy-load status reported by a chunk server in CURRENT_LOAD.
pub const HLSTATUS_DEFAULT: u8 = 0;
pub const HLSTATUS_OK: u8 = 1;
pub const HLSTATUS_OVERLOADED: u8 = 2;
pub const HLSTATUS_LSREBALANCE: u8 = 3;
pub const HLSTATUS_GRACEFUL: u8 = 4;
pub const HLSTATUS_HSREBALANCE: u8 = 5;

/// Bits of the `receivingchunks` state.
pub const TRANSFERRING_LOST_CHUNKS: u8 = 1;
pub const TRANSFERRING_NEW_CHUNKS: u8 = 2;

/// Maximum number of chunk servers addressable by csid.
pub const MAX_CS_COUNT: u16 = 10000;

/// One chunk of file data.
pub const CHUNK_SIZE: u64 = 64 * 1024 * 1024;

pub const CSTOMA_MAX_PACKET_SIZE: u32 = 1_000_000;
pub const ANTOMA_MAX_PACKET_SIZE: u32 = 100_000;

/// This master's software version, encoded the way peers expect it
/// (`major<<16 | mid<<8 | minor`).
pub const VERSION_MAJ: u16 = 4;
pub const VERSION_MID: u8 = 57;
pub const VERSION_MIN: u8 = 0;

pub const fn version2int(maj: u16, mid: u8, min: u8) -> u32 {
    ((maj as u32) << 16) | ((mid as u32) << 8) | (min as u32)
}

pub const VERSHEX: u32 = version2int(VERSION_MAJ, VERSION_MID, VERSION_MIN);

pub fn version_str() -> String {
    format!("{}.{}.{}", VERSION_MAJ, VERSION_MID, VERSION_MIN)
}

/// Chunk ids carry the erasure-coding part id in the top byte on the wire.
pub const fn combine_chunkid(chunkid: u64, ecid: u8) -> u64 {
    (chunkid & 0x00FF_FFFF_FFFF_FFFF) | ((ecid as u64) << 56)
}

pub const fn split_chunkid(combined: u64) -> (u64, u8) {
    (combined & 0x00FF_FFFF_FFFF_FFFF, (combined >> 56) as u8)
}

/// Human-readable suffix for an ecid, used in log lines.
pub fn ecid_to_str(ecid: u8) -> &'static str {
    const ECID8: [&str; 17] = [
        " (DE0)", " (DE1)", " (DE2)", " (DE3)", " (DE4)", " (DE5)", " (DE6)", " (DE7)",
        " (CE0)", " (CE1)", " (CE2)", " (CE3)", " (CE4)", " (CE5)", " (CE6)", " (CE7)", " (CE8)",
    ];
    const ECID4: [&str; 13] = [
        " (DF0)", " (DF1)", " (DF2)", " (DF3)",
        " (CF0)", " (CF1)", " (CF2)", " (CF3)", " (CF4)", " (CF5)", " (CF6)", " (CF7)", " (CF8)",
    ];
    if ecid & 0x20 != 0 {
        if (ecid & 0x1F) < 17 {
            return ECID8[(ecid & 0x1F) as usize];
        }
    } else if ecid & 0x10 != 0 {
        if (ecid & 0x0F) < 13 {
            return ECID4[(ecid & 0x0F) as usize];
        }
    } else if ecid == 0 {
        return " (COPY)";
    }
    " (???)"
}

pub fn status_str(status: u8) -> &'static str {
    match status {
        STATUS_OK => "OK",
        ERROR_ENOENT => "no such file or directory",
        ERROR_EACCES => "access denied",
        ERROR_EEXIST => "already exists",
        ERROR_EINVAL => "invalid argument",
        ERROR_IO => "input/output error",
        ERROR_MISMATCH => "data mismatch",
        ERROR_NOTFOUND => "not found",
        ERROR_ACTIVE => "still active",
        _ => "unknown error",
    }
}

pub fn ip_to_str(ip: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        (ip >> 24) & 0xFF,
        (ip >> 16) & 0xFF,
        (ip >> 8) & 0xFF,
        ip & 0xFF
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunkid_ecid_roundtrip() {
        let (chunkid, ecid) = split_chunkid(combine_chunkid(0x0012_3456_789A_BCDE, 0x21));
        assert_eq!(chunkid, 0x0012_3456_789A_BCDE);
        assert_eq!(ecid, 0x21);
        // the top byte of the raw id is masked off
        let (chunkid, ecid) = split_chunkid(combine_chunkid(u64::MAX, 0));
        assert_eq!(chunkid, 0x00FF_FFFF_FFFF_FFFF);
        assert_eq!(ecid, 0);
    }

    #[test]
    fn version_encoding() {
        assert_eq!(version2int(4, 12, 0), 0x040C00);
        assert!(VERSHEX >= version2int(4, 32, 0));
    }

    #[test]
    fn ecid_names() {
        assert_eq!(ecid_to_str(0), " (COPY)");
        assert_eq!(ecid_to_str(0x20), " (DE0)");
        assert_eq!(ecid_to_str(0x10), " (DF0)");
        assert_eq!(ecid_to_str(0xFF), " (???)");
    }
}
