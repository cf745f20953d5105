/// One recognized library: canonical load directive plus the substring used
/// to detect a pre-existing inclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibrarySpec {
    pub id: &'static str,
    pub directive: &'static str,
    pub detect: &'static str,
    pub implies: &'static [&'static str],
}

/// Recognized libraries, in the stable order directives are prepended.
pub const LIBRARY_TABLE: &[LibrarySpec] = &[
    LibrarySpec {
        id: "p5",
        directive: "loadScript('https://cdnjs.cloudflare.com/ajax/libs/p5.js/1.9.0/p5.min.js');",
        detect: "p5.min.js",
        implies: &[],
    },
    LibrarySpec {
        id: "p5.sound",
        directive: "loadScript('https://cdnjs.cloudflare.com/ajax/libs/p5.js/1.9.0/addons/p5.sound.min.js');",
        detect: "p5.sound.min.js",
        implies: &["p5"],
    },
    LibrarySpec {
        id: "matter-js",
        directive: "loadScript('https://cdnjs.cloudflare.com/ajax/libs/matter-js/0.19.0/matter.min.js');",
        detect: "matter.min.js",
        implies: &[],
    },
];

fn is_requested(spec: &LibrarySpec, libraries: &[String]) -> bool {
    libraries.iter().any(|lib| lib == spec.id)
        || LIBRARY_TABLE.iter().any(|other| {
            other.implies.contains(&spec.id) && libraries.iter().any(|lib| lib == other.id)
        })
}

/// Prepends the load directive for each requested library whose detection
/// substring is absent from the source. Directives land in table order, so
/// equal effective library sets always produce byte-identical output;
/// nothing is ever duplicated, making the call idempotent.
pub fn prepend_imports(source: &str, libraries: &[String]) -> String {
    let mut directives = Vec::new();
    for spec in LIBRARY_TABLE {
        if is_requested(spec, libraries) && !source.contains(spec.detect) {
            directives.push(spec.directive);
        }
    }
    if directives.is_empty() {
        return source.to_string();
    }
    format!("{}\n{source}", directives.join("\n"))
}
