//! Install-hint lookup keyed by `argv[0]` substring. Pure data, no platform detection.

/// Table of (substring, hint) pairs checked in order against the server command's
/// first argument (case-insensitive).
const HINTS: &[(&str, &str)] = &[
    ("rust-analyzer", "install with `rustup component add rust-analyzer`"),
    ("typescript-language-server", "install with `npm install -g typescript-language-server typescript`"),
    ("pyright", "install with `npm install -g pyright`"),
    ("pylsp", "install with `pip install python-lsp-server`"),
    ("gopls", "install with `go install golang.org/x/tools/gopls@latest`"),
    ("clangd", "install clangd via your platform's LLVM package"),
    ("solargraph", "install with `gem install solargraph`"),
    ("npx", "ensure Node.js and npm are installed and on PATH"),
];

/// Return a human-readable install hint for the given command's argv[0], falling back to
/// a generic message naming the command when no specific hint is known.
pub fn install_hint(argv0: &str) -> String {
    let lower = argv0.to_ascii_lowercase();
    for (needle, hint) in HINTS {
        if lower.contains(needle) {
            return (*hint).to_string();
        }
    }
    format!("ensure '{argv0}' is installed and available on PATH")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_command_returns_specific_hint() {
        assert!(install_hint("rust-analyzer").contains("rustup"));
        assert!(install_hint("/usr/local/bin/gopls").contains("go install"));
    }

    #[test]
    fn unknown_command_returns_generic_hint() {
        assert_eq!(
            install_hint("some-custom-lsp"),
            "ensure 'some-custom-lsp' is installed and available on PATH"
        );
    }
}
