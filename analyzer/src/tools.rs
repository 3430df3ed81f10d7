//! The subprocess analyzer table, one record literal per tool.
//!
//! Each tool's error classification is idiosyncratic and deliberately
//! preserved: `binwalk` warns on stderr even when extraction worked, so it
//! only errors when nothing was archived; `foremost` always chatters on
//! stderr, so only a long complaint counts; `zsteg` reports unsupported
//! formats on stdout; `jpseek` signals partial success through a marker
//! phrase rather than its exit code.

use indexmap::IndexMap;
use report::Output;

use crate::{
    driver::Captured,
    tool::{render, Tool},
};

/// `file -b`: one-line file type description.
pub fn file() -> Tool {
    Tool::builder()
        .name("file")
        .command(|s| vec!["file".into(), "-b".into(), s.image_ref()])
        .output(render::stdout_text)
        .build()
}

/// `identify -verbose`: ImageMagick's verbose image description.
pub fn identify() -> Tool {
    Tool::builder()
        .name("identify")
        .command(|s| vec!["identify".into(), "-verbose".into(), s.image_ref()])
        .build()
}

/// `strings`: printable sequences in the raw bytes.
pub fn strings() -> Tool {
    Tool::builder()
        .name("strings")
        .command(|s| vec!["strings".into(), s.image_ref()])
        .build()
}

/// `exiftool -a -u -g1`: metadata fields, parsed into an ordered mapping.
pub fn exiftool() -> Tool {
    Tool::builder()
        .name("exiftool")
        .command(|s| {
            vec![
                "exiftool".into(),
                "-a".into(),
                "-u".into(),
                "-g1".into(),
                s.image_ref(),
            ]
        })
        .output(exiftool_table)
        .build()
}

fn exiftool_table(captured: &Captured) -> Output {
    let mut table = IndexMap::new();
    for line in captured.stdout.lines() {
        if let Some((key, value)) = line.split_once(':') {
            table.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Output::Table(table)
}

const PNGCHECK_UNSUPPORTED: &str = "this is neither a PNG or JNG image nor a MNG stream";

/// `pngcheck -v`: chunk-level PNG validation.
pub fn pngcheck() -> Tool {
    Tool::builder()
        .name("pngcheck")
        .command(|s| vec!["pngcheck".into(), "-v".into(), s.image_ref()])
        .is_error(|c| c.stdout.contains(PNGCHECK_UNSUPPORTED))
        .error(|c| {
            if c.stdout.contains(PNGCHECK_UNSUPPORTED) {
                "The file format of the file is not supported (PNG or JNG only).".to_string()
            } else {
                c.stdout.clone()
            }
        })
        .build()
}

/// `binwalk --matryoshka -e`: recursive embedded-file carving.
pub fn binwalk() -> Tool {
    Tool::builder()
        .name("binwalk")
        .command(|s| {
            vec![
                "binwalk".into(),
                "--matryoshka".into(),
                "-e".into(),
                s.image_ref(),
                "--run-as=root".into(),
            ]
        })
        .has_archive(true)
        // binwalk creates `_<image>.extracted` itself.
        .make_folder(false)
        .extraction_dir(|s| {
            let name = s
                .image()
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            s.result_dir().join(format!("_{name}.extracted"))
        })
        // Warnings on stderr are fine as long as something was extracted.
        .is_error(|c| !c.stderr.is_empty() && !c.archived)
        .build()
}

/// `foremost`: header/footer based file carving.
pub fn foremost() -> Tool {
    Tool::builder()
        .name("foremost")
        .command(|s| {
            vec![
                "foremost".into(),
                "-o".into(),
                s.extraction_dir("foremost").to_string_lossy().to_string(),
                "-i".into(),
                s.image_ref(),
            ]
        })
        .has_archive(true)
        // foremost narrates progress on stderr; only a real complaint is long.
        .is_error(|c| c.stderr.len() > 60)
        .output(|c| {
            if c.stderr.contains("Processing") && c.stderr.contains("|*|") {
                Output::Lines(render::non_empty_lines(c.stderr.trim()))
            } else {
                Output::Lines(Vec::new())
            }
        })
        .build()
}

/// `outguess -r`: JPEG stego extraction. Deep analysis only.
pub fn outguess() -> Tool {
    Tool::builder()
        .name("outguess")
        .command(|s| {
            let out = s
                .extraction_dir("outguess")
                .join("outguess.data")
                .to_string_lossy()
                .to_string();
            let mut argv = vec!["outguess".to_string()];
            if let Some(password) = s.password() {
                argv.push("-k".into());
                argv.push(password.into());
            }
            argv.extend(["-r".into(), s.image_ref(), out]);
            argv
        })
        .has_archive(true)
        .build()
}

const JPSEEK_BANNER: [&str; 6] = [
    "jpseek, version 0.3 (c) 1998 Allan Latham <alatham@flexsys-group.com>",
    "This is licenced software but no charge is made for its use.",
    "NO WARRANTY whatsoever is offered with this product.",
    "NO LIABILITY whatsoever is accepted for its use.",
    "You are using this entirely at your OWN RISK.",
    "See the GNU Public Licence for full details.",
];

/// `jpseek`: driven through `expect` so it can answer the passphrase
/// prompt on its controlling terminal.
pub fn jpseek() -> Tool {
    Tool::builder()
        .name("jpseek")
        .command(|s| {
            let out = s
                .extraction_dir("jpseek")
                .join("jpseek.out")
                .to_string_lossy()
                .to_string();
            let password = s.password().unwrap_or_default();
            let script = format!(
                "spawn jpseek {img} {out}; expect \"Passphrase:\"; send \"{password}\\r\"; expect eof",
                img = s.image_ref(),
            );
            vec!["expect".into(), "-c".into(), script]
        })
        .has_archive(true)
        .is_error(|c| {
            c.code.map_or(true, |code| code != 0)
                && !c.combined().contains("File not completely recovered")
        })
        .output(|c| {
            let stripped = strip_jpseek_banner(&c.combined());
            if stripped.is_empty() {
                Output::Text("File completely recovered.".to_string())
            } else {
                Output::Text(stripped)
            }
        })
        .error(|c| strip_jpseek_banner(&c.combined()))
        .build()
}

fn strip_jpseek_banner(raw: &str) -> String {
    raw.lines()
        .filter(|line| {
            let line = line.trim();
            !line.is_empty()
                && !JPSEEK_BANNER.contains(&line)
                && !line.starts_with("spawn jpseek")
                && !line.starts_with("Passphrase:")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// `jsteg reveal`: LSB extraction from JPEG DCT coefficients.
pub fn jsteg() -> Tool {
    Tool::builder()
        .name("jsteg")
        .command(|s| vec!["jsteg".into(), "reveal".into(), s.image_ref()])
        .build()
}

const ZSTEG_UNSUPPORTED: &str = "PNG::NotSupported";

/// `zsteg`: PNG/BMP LSB channel sweeps.
pub fn zsteg() -> Tool {
    Tool::builder()
        .name("zsteg")
        .command(|s| vec!["zsteg".into(), s.image_ref()])
        .is_error(|c| !c.stderr.is_empty() || stdout_head(c).contains(ZSTEG_UNSUPPORTED))
        .error(|c| {
            if stdout_head(c).contains(ZSTEG_UNSUPPORTED) {
                "The file format of the file is not supported (PNG only).".to_string()
            } else {
                c.stderr.clone()
            }
        })
        .build()
}

fn stdout_head(captured: &Captured) -> String {
    captured.stdout.chars().take(100).collect()
}
