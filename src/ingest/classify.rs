//! Attachment classification.
//!
//! Each attachment lands in exactly one kind, evaluated in fixed priority
//! order: unsupported, direct upload, convertible media, text extractable,
//! unknown.

use crate::{Attachment, AttachmentSource};

/// Archives, executables and databases. Never sent to the provider.
const UNSUPPORTED_EXTENSIONS: &[&str] = &[
    "zip", "rar", "7z", "tar", "gz", "tgz", "bz2", "xz", "zst", "exe", "dll", "so", "dylib",
    "msi", "dmg", "iso", "img", "bin", "apk", "ipa", "jar", "deb", "rpm", "db", "sqlite",
    "sqlite3", "mdb", "accdb", "dbf",
];

/// MIME types the provider accepts as-is.
const DIRECT_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/heic",
    "image/heif",
    "video/mp4",
    "video/mpeg",
    "video/quicktime",
    "video/webm",
    "video/3gpp",
    "audio/wav",
    "audio/x-wav",
    "audio/mpeg",
    "audio/mp3",
    "audio/aiff",
    "audio/x-aiff",
    "audio/aac",
    "audio/ogg",
    "audio/flac",
    "audio/x-flac",
    "application/pdf",
    "text/plain",
];

const DIRECT_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "webp", "heic", "heif", "mp4", "mpeg", "mpg", "mov", "webm", "3gp",
    "wav", "mp3", "aiff", "aif", "aac", "ogg", "flac", "pdf", "txt",
];

const LEGACY_IMAGE_EXTENSIONS: &[&str] = &["bmp", "tif", "tiff", "ico", "tga", "pcx", "ppm", "pgm", "jp2"];

const LEGACY_AUDIO_EXTENSIONS: &[&str] = &["wma", "m4a", "opus", "amr", "ac3", "ape", "au", "ra", "mka"];

const LEGACY_VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "avi", "wmv", "flv", "m4v", "vob", "ogv", "mts", "3g2", "rm", "rmvb", "asf",
];

/// Formats with animation frames (or that may have them).
const ANIMATED_EXTENSIONS: &[&str] = &["gif", "apng"];

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "docx", "doc", "pptx", "xlsx", "odt", "ods", "odp", "rtf", "epub",
];

const CODE_AND_MARKUP_EXTENSIONS: &[&str] = &[
    "md", "markdown", "csv", "tsv", "json", "jsonl", "xml", "html", "htm", "yaml", "yml",
    "toml", "ini", "cfg", "conf", "log", "tex", "rst", "rs", "py", "js", "mjs", "ts", "tsx",
    "jsx", "java", "kt", "kts", "c", "h", "cc", "cpp", "hpp", "cs", "go", "rb", "php", "swift",
    "sh", "bash", "zsh", "ps1", "bat", "sql", "css", "scss", "lua", "r", "scala", "dart",
    "hs", "ex", "exs", "erl", "clj", "vue", "svelte", "proto", "graphql", "dockerfile",
];

/// Conversion applied before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaTarget {
    Png,
    Mp3,
    Mp4,
    /// First frame only, as PNG.
    StillFrame,
}

impl MediaTarget {
    pub fn extension(self) -> &'static str {
        match self {
            MediaTarget::Png | MediaTarget::StillFrame => "png",
            MediaTarget::Mp3 => "mp3",
            MediaTarget::Mp4 => "mp4",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            MediaTarget::Png | MediaTarget::StillFrame => "image/png",
            MediaTarget::Mp3 => "audio/mpeg",
            MediaTarget::Mp4 => "video/mp4",
        }
    }
}

/// Conversion route for convertible media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionPlan {
    /// Single conversion.
    Convert(MediaTarget),
    /// Animated media: MP4 first, still frame if that fails.
    Animated,
}

/// Classification of one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Unsupported,
    DirectUpload,
    ConvertibleMedia(ConversionPlan),
    TextExtractable,
    Unknown,
}

/// Classify an attachment. Pure.
pub fn classify(attachment: &Attachment) -> AttachmentKind {
    let extension = attachment.extension().unwrap_or_default();
    let mime_type = attachment.mime_type();
    let ext = extension.as_str();

    if UNSUPPORTED_EXTENSIONS.contains(&ext) || is_unsupported_mime(&mime_type) {
        return AttachmentKind::Unsupported;
    }

    if DIRECT_MIME_TYPES.contains(&mime_type.as_str()) || DIRECT_EXTENSIONS.contains(&ext) {
        return AttachmentKind::DirectUpload;
    }

    if let Some(plan) = conversion_plan(attachment, ext, &mime_type) {
        return AttachmentKind::ConvertibleMedia(plan);
    }

    if DOCUMENT_EXTENSIONS.contains(&ext)
        || CODE_AND_MARKUP_EXTENSIONS.contains(&ext)
        || mime_type.starts_with("text/")
    {
        return AttachmentKind::TextExtractable;
    }

    AttachmentKind::Unknown
}

fn is_unsupported_mime(mime_type: &str) -> bool {
    matches!(
        mime_type,
        "application/zip"
            | "application/x-zip-compressed"
            | "application/x-rar-compressed"
            | "application/vnd.rar"
            | "application/x-7z-compressed"
            | "application/x-tar"
            | "application/gzip"
            | "application/x-msdownload"
            | "application/x-executable"
            | "application/vnd.sqlite3"
            | "application/x-sqlite3"
    )
}

fn conversion_plan(attachment: &Attachment, ext: &str, mime_type: &str) -> Option<ConversionPlan> {
    // Stickers and custom emoji that were not directly uploadable are treated
    // as animated regardless of their extension.
    if ANIMATED_EXTENSIONS.contains(&ext)
        || mime_type == "image/gif"
        || mime_type == "image/apng"
        || matches!(
            attachment.source,
            AttachmentSource::Sticker | AttachmentSource::Emoji
        )
    {
        return Some(ConversionPlan::Animated);
    }

    // `.ts` is TypeScript unless the uploader declared an MPEG transport stream.
    if CODE_AND_MARKUP_EXTENSIONS.contains(&ext) && mime_type != "video/mp2t" {
        return None;
    }

    if LEGACY_IMAGE_EXTENSIONS.contains(&ext) || mime_type.starts_with("image/") {
        return Some(ConversionPlan::Convert(MediaTarget::Png));
    }
    if LEGACY_AUDIO_EXTENSIONS.contains(&ext) || mime_type.starts_with("audio/") {
        return Some(ConversionPlan::Convert(MediaTarget::Mp3));
    }
    if LEGACY_VIDEO_EXTENSIONS.contains(&ext) || mime_type.starts_with("video/") {
        return Some(ConversionPlan::Convert(MediaTarget::Mp4));
    }

    None
}
