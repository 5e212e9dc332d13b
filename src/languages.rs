use std::path::Path;

/// First-KiB NUL sniff, the same heuristic git itself applies.
pub fn is_binary(data: &[u8]) -> bool {
    data.iter().take(8000).any(|&b| b == 0)
}

/// Best-effort language of a file, judged from its name and the first KiB of
/// content. Returns `None` for files we cannot classify, which an allow-list
/// treats as "filtered out".
pub fn detect(name: &str, first_kb: &[u8]) -> Option<&'static str> {
    let base = Path::new(name).file_name()?.to_str()?;
    match base {
        "Makefile" | "makefile" | "GNUmakefile" => return Some("Makefile"),
        "Dockerfile" => return Some("Dockerfile"),
        "CMakeLists.txt" => return Some("CMake"),
        _ => {}
    }

    let ext = Path::new(base).extension().and_then(|e| e.to_str());
    if let Some(lang) = ext.and_then(by_extension) {
        return Some(lang);
    }

    // Scripts without an extension often open with a shebang.
    if first_kb.starts_with(b"#!") {
        let line = String::from_utf8_lossy(&first_kb[..first_kb.len().min(120)]).into_owned();
        if line.contains("python") {
            return Some("Python");
        }
        if line.contains("bash") || line.contains("/sh") {
            return Some("Shell");
        }
        if line.contains("perl") {
            return Some("Perl");
        }
    }
    None
}

fn by_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "rs" => "Rust",
        "go" => "Go",
        "c" | "h" => "C",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" | "hxx" => "C++",
        "cs" => "C#",
        "java" => "Java",
        "kt" | "kts" => "Kotlin",
        "scala" => "Scala",
        "py" | "pyi" => "Python",
        "rb" => "Ruby",
        "php" => "PHP",
        "pl" | "pm" => "Perl",
        "js" | "mjs" | "cjs" => "JavaScript",
        "jsx" => "JSX",
        "ts" | "mts" => "TypeScript",
        "tsx" => "TSX",
        "swift" => "Swift",
        "m" | "mm" => "Objective-C",
        "dart" => "Dart",
        "lua" => "Lua",
        "r" | "R" => "R",
        "jl" => "Julia",
        "hs" => "Haskell",
        "ml" | "mli" => "OCaml",
        "ex" | "exs" => "Elixir",
        "erl" | "hrl" => "Erlang",
        "clj" | "cljs" => "Clojure",
        "groovy" => "Groovy",
        "sh" | "bash" => "Shell",
        "ps1" => "PowerShell",
        "sql" => "SQL",
        "html" | "htm" => "HTML",
        "css" => "CSS",
        "scss" | "sass" => "SCSS",
        "vue" => "Vue",
        "proto" => "Protocol Buffer",
        "cmake" => "CMake",
        "tf" => "HCL",
        "yml" | "yaml" => "YAML",
        "toml" => "TOML",
        "json" => "JSON",
        "xml" => "XML",
        "md" | "markdown" => "Markdown",
        "rst" => "reStructuredText",
        "tex" => "TeX",
        "asm" | "s" | "S" => "Assembly",
        "zig" => "Zig",
        "nim" => "Nim",
        "f" | "f90" | "f95" => "Fortran",
        "pas" => "Pascal",
        "vb" => "Visual Basic",
        "fs" | "fsx" => "F#",
        _ => return None,
    })
}

/// Paths that are overwhelmingly third-party or generated; skipped when the
/// default blacklist is enabled.
pub fn default_blacklist() -> &'static [&'static str] {
    &["vendor/", "node_modules/", "package-lock.json", "Gopkg.lock"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_extension_and_name() {
        assert_eq!(detect("src/main.rs", b"fn main() {}"), Some("Rust"));
        assert_eq!(detect("a/b/Makefile", b""), Some("Makefile"));
        assert_eq!(detect("bin/run", b"#!/usr/bin/env python3\n"), Some("Python"));
        assert_eq!(detect("LICENSE", b"MIT"), None);
    }

    #[test]
    fn nul_byte_means_binary() {
        assert!(is_binary(b"\x7fELF\x00\x01"));
        assert!(!is_binary(b"plain text\n"));
    }
}
