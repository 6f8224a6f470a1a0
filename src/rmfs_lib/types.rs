//! Wire-level constants shared by the master core: status codes, node
//! types, session flags, lock opcodes and the message-type numbers of the
//! client <-> master protocol.
#![allow(dead_code)]

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Closed set of reply status codes. Every reply carries either a success
/// payload or one of these in a single status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MfsStatus {
    Ok = 0,
    EPerm = 1,
    ENotDir = 2,
    ENoEnt = 3,
    EAcces = 4,
    EExist = 5,
    EInval = 6,
    ENotEmpty = 7,
    ChunkLost = 8,
    OutOfMemory = 9,
    IndexTooBig = 10,
    Locked = 11,
    NoChunkServers = 12,
    NoChunk = 13,
    ChunkBusy = 14,
    Register = 15,
    NotDone = 16,
    NotOpened = 17,
    NotStarted = 18,
    WrongVersion = 19,
    ChunkExist = 20,
    NoSpace = 21,
    IO = 22,
    BNumTooBig = 23,
    WrongSize = 24,
    WrongOffset = 25,
    CantConnect = 26,
    WrongChunkId = 27,
    Disconnected = 28,
    Crc = 29,
    Delayed = 30,
    CantCreatePath = 31,
    Mismatch = 32,
    ERofs = 33,
    Quota = 34,
    BadSessionId = 35,
    NoPassword = 36,
    BadPassword = 37,
    ENoAttr = 38,
    ENotSup = 39,
    ERange = 40,
    NotFound = 41,
    Active = 42,
    CsNotPresent = 43,
    Waiting = 44,
    EAgain = 45,
    EIntr = 46,
    ECanceled = 47,
    ENoEntNoCache = 48,
    EPermNotAdmin = 49,
    ClassExists = 50,
    ClassLimitReached = 51,
    NoSuchClass = 52,
    ClassInUse = 53,
    IncompatVersion = 54,
    PatternExists = 55,
    PatLimitReached = 56,
    NoSuchPattern = 57,
    ENameTooLong = 58,
    EMLink = 59,
    ETimedOut = 60,
    EBadF = 61,
    EFBig = 62,
    EIsDir = 63,
}

impl std::fmt::Display for MfsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for MfsStatus {}

/// Inode types as stored in metadata and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum NodeType {
    File = 1,
    Directory = 2,
    Symlink = 3,
    Fifo = 4,
    BlockDev = 5,
    CharDev = 6,
    Socket = 7,
    Trash = 8,
    Sustained = 9,
}

impl NodeType {
    pub fn is_file_like(self) -> bool {
        matches!(self, NodeType::File | NodeType::Trash | NodeType::Sustained)
    }
}

pub const ROOT_INODE: u32 = 1;
pub const MAX_NAME_LENG: usize = 255;
pub const MAX_PATH_LENG: usize = 1024;
pub const MAX_LINK_COUNT: u32 = 65000;

pub const TRASH_BUCKETS: usize = 4096;
pub const SUSTAINED_BUCKETS: usize = 256;

/* session flags */
pub const SESFLAG_READONLY: u8 = 0x01;
pub const SESFLAG_DYNAMICIP: u8 = 0x02;
pub const SESFLAG_IGNOREGID: u8 = 0x04;
pub const SESFLAG_ADMIN: u8 = 0x08;
pub const SESFLAG_MAPALL: u8 = 0x10;
pub const SESFLAG_ATTRBIT: u8 = 0x40; // client understands the 36-byte attr record
pub const SESFLAG_METARESTORE: u8 = 0x80;

/* flock operations */
pub const FLOCK_UNLOCK: u8 = 0;
pub const FLOCK_TRY_SHARED: u8 = 1;
pub const FLOCK_LOCK_SHARED: u8 = 2;
pub const FLOCK_TRY_EXCLUSIVE: u8 = 3;
pub const FLOCK_LOCK_EXCLUSIVE: u8 = 4;
pub const FLOCK_INTERRUPT: u8 = 5;
pub const FLOCK_RELEASE: u8 = 6;

/* posix lock commands and types */
pub const POSIX_LOCK_CMD_GET: u8 = 0;
pub const POSIX_LOCK_CMD_SET: u8 = 1;
pub const POSIX_LOCK_CMD_TRY: u8 = 2;
pub const POSIX_LOCK_CMD_INT: u8 = 3;

pub const POSIX_LOCK_UNLCK: u8 = 0;
pub const POSIX_LOCK_RDLCK: u8 = 1;
pub const POSIX_LOCK_WRLCK: u8 = 2;

/* label expressions */
pub const SCLASS_EXPR_MAX_SIZE: usize = 128;
pub const SCLASS_EXPR_TYPE_MASK: u8 = 0xC0;
pub const SCLASS_EXPR_VALUE_MASK: u8 = 0x3F;
pub const SCLASS_EXPR_SYMBOL: u8 = 0xC0;
pub const SCLASS_EXPR_SYMBOL_ANY: u8 = 0xFF;
pub const SCLASS_EXPR_OP_AND: u8 = 0x80;
pub const SCLASS_EXPR_OP_OR: u8 = 0x40;
pub const SCLASS_EXPR_OP_ONE: u8 = 0x00;
pub const SCLASS_EXPR_OP_NOT: u8 = 0x01;

pub const UNIQ_MASK_IP: u32 = 1 << (1 + b'Z' - b'A');
pub const UNIQ_MASK_RACK: u32 = 1 << (2 + b'Z' - b'A');

pub const LABELS_MODE_LOOSE: u8 = 0;
pub const LABELS_MODE_STD: u8 = 1;
pub const LABELS_MODE_STRICT: u8 = 2;
pub const LABELS_MODE_GLOBAL: u8 = 0xFF;

/* storage class arch-mode flags */
pub const SCLASS_ARCH_MODE_CTIME: u8 = 0x01;
pub const SCLASS_ARCH_MODE_MTIME: u8 = 0x02;
pub const SCLASS_ARCH_MODE_ATIME: u8 = 0x04;
pub const SCLASS_ARCH_MODE_REVERSIBLE: u8 = 0x08;
pub const SCLASS_ARCH_MODE_FAST: u8 = 0x10;
pub const SCLASS_ARCH_MODE_CHUNK: u8 = 0x20;

/* storage class change masks */
pub const SCLASS_CHG_ADMIN_ONLY: u16 = 0x0001;
pub const SCLASS_CHG_LABELS_MODE: u16 = 0x0002;
pub const SCLASS_CHG_ARCH_DELAY: u16 = 0x0004;
pub const SCLASS_CHG_MIN_TRASHRETENTION: u16 = 0x0008;
pub const SCLASS_CHG_CREATE_MASKS: u16 = 0x0010;
pub const SCLASS_CHG_KEEP_MASKS: u16 = 0x0020;
pub const SCLASS_CHG_ARCH_MASKS: u16 = 0x0040;
pub const SCLASS_CHG_TRASH_MASKS: u16 = 0x0080;
pub const SCLASS_CHG_ARCH_MODE: u16 = 0x0100;
pub const SCLASS_CHG_ARCH_MIN_SIZE: u16 = 0x0200;
pub const SCLASS_CHG_EXPORT_GROUP: u16 = 0x0400;

/* trash retention change modes */
pub const SMODE_SET: u8 = 0;
pub const SMODE_INCREASE: u8 = 1;
pub const SMODE_DECREASE: u8 = 2;

/* extended attribute bits (the eattr nibble) */
pub const EATTR_NOOWNER: u8 = 0x01;
pub const EATTR_NOACACHE: u8 = 0x02;
pub const EATTR_NOECACHE: u8 = 0x04;
pub const EATTR_NODATACACHE: u8 = 0x08;

/* pattern override mask */
pub const PATTERN_EUGID_ANY: u32 = 0xFFFF_FFFF;
pub const PATTERN_OMASK_SCLASS: u8 = 0x01;
pub const PATTERN_OMASK_TRASHRETENTION: u8 = 0x02;
pub const PATTERN_OMASK_EATTR: u8 = 0x04;

/* disables bitmask: operations a session is denied */
pub const DISABLE_CHOWN: u32 = 1 << 0;
pub const DISABLE_CHMOD: u32 = 1 << 1;
pub const DISABLE_SYMLINK: u32 = 1 << 2;
pub const DISABLE_MKFIFO: u32 = 1 << 3;
pub const DISABLE_MKDEV: u32 = 1 << 4;
pub const DISABLE_MKSOCK: u32 = 1 << 5;
pub const DISABLE_MKDIR: u32 = 1 << 6;
pub const DISABLE_UNLINK: u32 = 1 << 7;
pub const DISABLE_RMDIR: u32 = 1 << 8;
pub const DISABLE_RENAME: u32 = 1 << 9;
pub const DISABLE_MOVE: u32 = 1 << 10;
pub const DISABLE_LINK: u32 = 1 << 11;
pub const DISABLE_CREATE: u32 = 1 << 12;
pub const DISABLE_READDIR: u32 = 1 << 13;
pub const DISABLE_READ: u32 = 1 << 14;
pub const DISABLE_WRITE: u32 = 1 << 15;
pub const DISABLE_TRUNCATE: u32 = 1 << 16;
pub const DISABLE_SETLENGTH: u32 = 1 << 17;
pub const DISABLE_SETTRASH: u32 = 1 << 20;
pub const DISABLE_SETSCLASS: u32 = 1 << 21;
pub const DISABLE_SETEATTR: u32 = 1 << 22;
pub const DISABLE_SETXATTR: u32 = 1 << 23;
pub const DISABLE_SETFACL: u32 = 1 << 24;

/* quota flags */
pub const QUOTA_FLAG_SINODES: u8 = 0x01;
pub const QUOTA_FLAG_SLENGTH: u8 = 0x02;
pub const QUOTA_FLAG_SSIZE: u8 = 0x04;
pub const QUOTA_FLAG_SREALSIZE: u8 = 0x08;
pub const QUOTA_FLAG_HINODES: u8 = 0x10;
pub const QUOTA_FLAG_HLENGTH: u8 = 0x20;
pub const QUOTA_FLAG_HSIZE: u8 = 0x40;
pub const QUOTA_FLAG_HREALSIZE: u8 = 0x80;

/* registration */
pub const FUSE_REGISTER_BLOB_ACL: &[u8; 64] =
    b"DjI1GAQDULI5d2YjA26ypc3ovkhjvhciTQVx3CS4nYgtBoUcsljiVpsErJENHaw0";
pub const FUSE_REGISTER_BLOB_TOOLS_NOACL: &[u8; 64] =
    b"kFh9mdZsR84l5e675v8bi54VfXaXSYozaU3DSz9AsLLtOtKipzb9aQNkxeOISx63";

pub const REGISTER_GETRANDOM: u8 = 1;
pub const REGISTER_NEWSESSION: u8 = 2;
pub const REGISTER_RECONNECT: u8 = 3;
pub const REGISTER_TOOLS: u8 = 4;
pub const REGISTER_NEWMETASESSION: u8 = 5;
pub const REGISTER_CLOSESESSION: u8 = 6;

/* registration state of a connection */
pub const REGSTATE_UNREGISTERED: u8 = 0;
pub const REGSTATE_MOUNT: u8 = 1;
pub const REGSTATE_TOOL: u8 = 100;

/* per-direction packet size caps */
pub const CLTOMA_MAXPACKETSIZE: u32 = 50_000_000;
pub const MATOCL_MAXPACKETSIZE: u32 = 100_000_000;

pub const PROTO_BASE: u32 = 1000;

/* any <-> any */
pub const ANTOAN_NOP: u32 = 0;
pub const ANTOAN_UNKNOWN_COMMAND: u32 = 1;
pub const ANTOAN_BAD_COMMAND_SIZE: u32 = 2;

// The two message-type groups below are direction-specific on purpose and
// must stay separate: a numeric code may be reused on the opposite
// direction of the same connection, so dispatch only ever indexes the
// group matching the packet's direction.

/* client -> master */
pub const CLTOMA_FUSE_REGISTER: u32 = PROTO_BASE + 400;
pub const CLTOMA_FUSE_STATFS: u32 = PROTO_BASE + 402;
pub const CLTOMA_FUSE_ACCESS: u32 = PROTO_BASE + 404;
pub const CLTOMA_FUSE_LOOKUP: u32 = PROTO_BASE + 406;
pub const CLTOMA_FUSE_GETATTR: u32 = PROTO_BASE + 408;
pub const CLTOMA_FUSE_SETATTR: u32 = PROTO_BASE + 410;
pub const CLTOMA_FUSE_READLINK: u32 = PROTO_BASE + 412;
pub const CLTOMA_FUSE_SYMLINK: u32 = PROTO_BASE + 414;
pub const CLTOMA_FUSE_MKNOD: u32 = PROTO_BASE + 416;
pub const CLTOMA_FUSE_MKDIR: u32 = PROTO_BASE + 418;
pub const CLTOMA_FUSE_UNLINK: u32 = PROTO_BASE + 420;
pub const CLTOMA_FUSE_RMDIR: u32 = PROTO_BASE + 422;
pub const CLTOMA_FUSE_RENAME: u32 = PROTO_BASE + 424;
pub const CLTOMA_FUSE_LINK: u32 = PROTO_BASE + 426;
pub const CLTOMA_FUSE_READDIR: u32 = PROTO_BASE + 428;
pub const CLTOMA_FUSE_OPEN: u32 = PROTO_BASE + 430;
pub const CLTOMA_FUSE_READ_CHUNK: u32 = PROTO_BASE + 432;
pub const CLTOMA_FUSE_WRITE_CHUNK: u32 = PROTO_BASE + 434;
pub const CLTOMA_FUSE_WRITE_CHUNK_END: u32 = PROTO_BASE + 436;
pub const CLTOMA_FUSE_CHECK: u32 = PROTO_BASE + 440;
pub const CLTOMA_FUSE_GETTRASHRETENTION: u32 = PROTO_BASE + 442;
pub const CLTOMA_FUSE_SETTRASHRETENTION: u32 = PROTO_BASE + 444;
pub const CLTOMA_FUSE_GETSCLASS: u32 = PROTO_BASE + 446;
pub const CLTOMA_FUSE_SETSCLASS: u32 = PROTO_BASE + 448;
pub const CLTOMA_FUSE_GETTRASH: u32 = PROTO_BASE + 450;
pub const CLTOMA_FUSE_GETDETACHEDATTR: u32 = PROTO_BASE + 452;
pub const CLTOMA_FUSE_GETTRASHPATH: u32 = PROTO_BASE + 454;
pub const CLTOMA_FUSE_SETTRASHPATH: u32 = PROTO_BASE + 456;
pub const CLTOMA_FUSE_UNDEL: u32 = PROTO_BASE + 458;
pub const CLTOMA_FUSE_PURGE: u32 = PROTO_BASE + 460;
pub const CLTOMA_FUSE_GETSUSTAINED: u32 = PROTO_BASE + 462;
pub const CLTOMA_FUSE_GETEATTR: u32 = PROTO_BASE + 466;
pub const CLTOMA_FUSE_SETEATTR: u32 = PROTO_BASE + 468;
pub const CLTOMA_FUSE_GETXATTR: u32 = PROTO_BASE + 470;
pub const CLTOMA_FUSE_SETXATTR: u32 = PROTO_BASE + 472;
pub const CLTOMA_FUSE_GETQUOTA: u32 = PROTO_BASE + 474;
pub const CLTOMA_FUSE_SETQUOTA: u32 = PROTO_BASE + 476;
pub const CLTOMA_FUSE_FLOCK: u32 = PROTO_BASE + 510;
pub const CLTOMA_FUSE_POSIX_LOCK: u32 = PROTO_BASE + 512;
pub const CLTOMA_SCLASS_CREATE: u32 = PROTO_BASE + 350;
pub const CLTOMA_SCLASS_CHANGE: u32 = PROTO_BASE + 352;
pub const CLTOMA_SCLASS_DELETE: u32 = PROTO_BASE + 354;
pub const CLTOMA_SCLASS_DUPLICATE: u32 = PROTO_BASE + 356;
pub const CLTOMA_SCLASS_RENAME: u32 = PROTO_BASE + 358;
pub const CLTOMA_SCLASS_LIST: u32 = PROTO_BASE + 360;
// shares its numeric code with MATOCL_FUSE_INVALIDATE_CHUNK_CACHE on the
// opposite direction in the legacy table; dispatch is direction-aware so
// only this group is ever used for inbound packets
pub const CLTOMA_FUSE_SUSTAINED_INODES: u32 = PROTO_BASE + 700;
pub const CLTOMA_PATTERN_ADD: u32 = PROTO_BASE + 370;
pub const CLTOMA_PATTERN_DELETE: u32 = PROTO_BASE + 372;
pub const CLTOMA_PATTERN_LIST: u32 = PROTO_BASE + 374;

/* master -> client */
pub const MATOCL_FUSE_REGISTER: u32 = PROTO_BASE + 401;
pub const MATOCL_FUSE_STATFS: u32 = PROTO_BASE + 403;
pub const MATOCL_FUSE_ACCESS: u32 = PROTO_BASE + 405;
pub const MATOCL_FUSE_LOOKUP: u32 = PROTO_BASE + 407;
pub const MATOCL_FUSE_GETATTR: u32 = PROTO_BASE + 409;
pub const MATOCL_FUSE_SETATTR: u32 = PROTO_BASE + 411;
pub const MATOCL_FUSE_READLINK: u32 = PROTO_BASE + 413;
pub const MATOCL_FUSE_SYMLINK: u32 = PROTO_BASE + 415;
pub const MATOCL_FUSE_MKNOD: u32 = PROTO_BASE + 417;
pub const MATOCL_FUSE_MKDIR: u32 = PROTO_BASE + 419;
pub const MATOCL_FUSE_UNLINK: u32 = PROTO_BASE + 421;
pub const MATOCL_FUSE_RMDIR: u32 = PROTO_BASE + 423;
pub const MATOCL_FUSE_RENAME: u32 = PROTO_BASE + 425;
pub const MATOCL_FUSE_LINK: u32 = PROTO_BASE + 427;
pub const MATOCL_FUSE_READDIR: u32 = PROTO_BASE + 429;
pub const MATOCL_FUSE_OPEN: u32 = PROTO_BASE + 431;
pub const MATOCL_FUSE_READ_CHUNK: u32 = PROTO_BASE + 433;
pub const MATOCL_FUSE_WRITE_CHUNK: u32 = PROTO_BASE + 435;
pub const MATOCL_FUSE_WRITE_CHUNK_END: u32 = PROTO_BASE + 437;
pub const MATOCL_FUSE_CHECK: u32 = PROTO_BASE + 441;
pub const MATOCL_FUSE_GETTRASHRETENTION: u32 = PROTO_BASE + 443;
pub const MATOCL_FUSE_SETTRASHRETENTION: u32 = PROTO_BASE + 445;
pub const MATOCL_FUSE_GETSCLASS: u32 = PROTO_BASE + 447;
pub const MATOCL_FUSE_SETSCLASS: u32 = PROTO_BASE + 449;
pub const MATOCL_FUSE_GETTRASH: u32 = PROTO_BASE + 451;
pub const MATOCL_FUSE_GETDETACHEDATTR: u32 = PROTO_BASE + 453;
pub const MATOCL_FUSE_GETTRASHPATH: u32 = PROTO_BASE + 455;
pub const MATOCL_FUSE_SETTRASHPATH: u32 = PROTO_BASE + 457;
pub const MATOCL_FUSE_UNDEL: u32 = PROTO_BASE + 459;
pub const MATOCL_FUSE_PURGE: u32 = PROTO_BASE + 461;
pub const MATOCL_FUSE_GETSUSTAINED: u32 = PROTO_BASE + 463;
pub const MATOCL_FUSE_GETEATTR: u32 = PROTO_BASE + 467;
pub const MATOCL_FUSE_SETEATTR: u32 = PROTO_BASE + 469;
pub const MATOCL_FUSE_GETXATTR: u32 = PROTO_BASE + 471;
pub const MATOCL_FUSE_SETXATTR: u32 = PROTO_BASE + 473;
pub const MATOCL_FUSE_GETQUOTA: u32 = PROTO_BASE + 475;
pub const MATOCL_FUSE_SETQUOTA: u32 = PROTO_BASE + 477;
pub const MATOCL_FUSE_FLOCK: u32 = PROTO_BASE + 511;
pub const MATOCL_FUSE_POSIX_LOCK: u32 = PROTO_BASE + 513;
pub const MATOCL_SCLASS_CREATE: u32 = PROTO_BASE + 351;
pub const MATOCL_SCLASS_CHANGE: u32 = PROTO_BASE + 353;
pub const MATOCL_SCLASS_DELETE: u32 = PROTO_BASE + 355;
pub const MATOCL_SCLASS_DUPLICATE: u32 = PROTO_BASE + 357;
pub const MATOCL_SCLASS_RENAME: u32 = PROTO_BASE + 359;
pub const MATOCL_SCLASS_LIST: u32 = PROTO_BASE + 361;
pub const MATOCL_PATTERN_ADD: u32 = PROTO_BASE + 371;
pub const MATOCL_PATTERN_DELETE: u32 = PROTO_BASE + 373;
pub const MATOCL_PATTERN_LIST: u32 = PROTO_BASE + 375;
