use analyzer::{analyze, AnalysisPolicy, Layer, SafetyAnalyzer, DENYLIST_VERSION};

fn plotting_policy() -> AnalysisPolicy {
    AnalysisPolicy::new(["pandas", "numpy", "matplotlib", "mplsoccer", "math", "statistics"])
}

#[cfg(test)]
mod analyzer_tests {
    use super::*;

    #[test]
    fn test_generated_chart_is_accepted() {
        let source = r#"
fig, ax = plt.subplots(figsize=(10, 6))
top_scorers = df.nlargest(10, 'goals')
ax.barh(top_scorers['player'], top_scorers['goals'], color='#1f77b4')
ax.set_xlabel('Goals')
ax.set_title('Top scorers')
plt.tight_layout()
"#;
        let verdict = analyze(source, &plotting_policy());
        assert!(verdict.allowed, "unexpected violations: {:?}", verdict.summary());
        assert_eq!(verdict.denylist_version, DENYLIST_VERSION);
    }

    #[test]
    fn test_dynamic_import_is_rejected_by_both_layers() {
        let verdict = analyze("m = __import__('os')\nm.system('id')", &plotting_policy());
        assert!(!verdict.allowed);
        assert!(verdict.has_pattern("text:dunder-import"));
        assert!(verdict.has_pattern("ast:banned-builtin"));
        assert!(verdict.has_pattern("ast:code-generation"));
        assert!(verdict.violations.iter().any(|v| v.layer == Layer::Textual));
        assert!(verdict.violations.iter().any(|v| v.layer == Layer::Structural));
    }

    #[test]
    fn test_obfuscated_escape_is_caught_structurally() {
        let verdict = analyze("name = '__func__'\n", &plotting_policy());
        assert!(!verdict.allowed);
        assert!(verdict.has_pattern("ast:dunder-string"));
        assert!(verdict.violations.iter().all(|v| v.layer == Layer::Structural));
    }

    #[test]
    fn test_every_violation_is_reported() {
        let source = "import subprocess\nopen('/etc/passwd')\nx = ().__class__\n";
        let verdict = analyze(source, &plotting_policy());
        assert!(!verdict.allowed);

        for id in [
            "text:subprocess",
            "text:open-call",
            "text:dunder-escape",
            "ast:import-not-allowed",
            "ast:banned-builtin",
            "ast:dunder-attribute",
        ] {
            assert!(verdict.has_pattern(id), "missing {id}: {:?}", verdict.summary());
        }
    }

    #[test]
    fn test_violations_are_sorted_by_location() {
        let verdict = analyze("x = 1\nf = eval\nimport os\n", &plotting_policy());
        let lines: Vec<usize> = verdict.violations.iter().map(|v| v.location.line).collect();
        let mut sorted = lines.clone();
        sorted.sort_unstable();
        assert_eq!(lines, sorted);
        assert_eq!(verdict.violations[0].location.line, 2);
    }

    #[test]
    fn test_unparsable_input_is_a_violation_not_a_crash() {
        let verdict = analyze("for for for ((((", &plotting_policy());
        assert!(!verdict.allowed);
        assert!(verdict.has_pattern("ast:syntax-error"));
    }

    #[test]
    fn test_binary_garbage_does_not_panic() {
        let source = "\u{0}\u{1}\u{7f}x = \u{feff}1\n\t\t\u{2028}";
        let _ = analyze(source, &plotting_policy());
    }

    #[test]
    fn test_imports_follow_policy() {
        let narrow = AnalysisPolicy::new(["matplotlib"]);
        assert!(analyze("import matplotlib.pyplot as plt", &narrow).allowed);
        let verdict = analyze("import pandas as pd", &narrow);
        assert!(verdict.has_pattern("ast:import-not-allowed"));
    }

    #[test]
    fn test_custom_patterns_extend_the_prefilter() {
        let analyzer = SafetyAnalyzer::with_custom_patterns(&[r"\bwhile\s+True\b".to_string()]).unwrap();
        let verdict = analyzer.analyze("while True:\n    pass\n", &plotting_policy());
        assert!(verdict.has_pattern("text:custom:1"));
    }

    #[test]
    fn test_verdict_serializes() {
        let verdict = analyze("f = eval", &plotting_policy());
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["allowed"], serde_json::json!(false));
        assert_eq!(json["violations"][0]["layer"], serde_json::json!("structural"));
    }

    #[test]
    fn test_file_access_through_library_calls_is_rejected() {
        for source in [
            "df.to_latex('/tmp/table.tex')",
            "df.to_markdown('/tmp/table.md')",
            "df.to_string('/tmp/table.txt')",
            "plt.imsave('/tmp/pitch.png', [[0.0]])",
            "img = plt.imread('/etc/hosts')\nprint(img)",
            "rows = np.fromregex('/etc/passwd', r'(.*)', [('l', 'U80')])\nprint(rows)",
            "arr = np.load('/tmp/arr.npy')",
            "np.savez('/tmp/arr.npz', a=[1])",
        ] {
            let verdict = analyze(source, &plotting_policy());
            assert!(!verdict.allowed, "{source} must be rejected");
            assert!(
                verdict.has_pattern("ast:filesystem-io"),
                "{source}: {:?}",
                verdict.summary()
            );
        }
    }

    #[test]
    fn test_text_rendering_without_a_target_is_allowed() {
        let source = "print(df.head().to_string(index=False))\nprint(df.to_markdown())\n";
        let verdict = analyze(source, &plotting_policy());
        assert!(verdict.allowed, "unexpected violations: {:?}", verdict.summary());
    }

    #[test]
    fn test_expression_string_evaluation_is_rejected() {
        let verdict = analyze("top = df.query('goals > 2')", &plotting_policy());
        assert!(!verdict.allowed);
        assert!(verdict.has_pattern("ast:code-generation"));
    }
}
