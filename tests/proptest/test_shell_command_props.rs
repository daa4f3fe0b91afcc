//! Property-based tests for shell command rendering
//!
//! Whatever the arguments, a rendered command must split back into the
//! same words and never carry a line break onto the console.

use lava_deploy::shell::{quote, ShellCommand};
use lava_deploy::testing::split_words;
use proptest::prelude::*;

proptest! {
    #[test]
    fn test_quoted_word_splits_back(word in "\\PC{0,60}") {
        prop_assert_eq!(split_words(&quote(&word)), vec![word]);
    }

    #[test]
    fn test_rendered_args_split_back(
        program in "[a-z][a-z0-9-]{0,10}",
        args in prop::collection::vec("\\PC{0,40}", 0..5),
    ) {
        let line = ShellCommand::new(program.clone())
            .args(args.iter().cloned())
            .render()
            .unwrap();

        let mut expected = vec![program];
        expected.extend(args);
        prop_assert_eq!(split_words(&line), expected);
    }

    #[test]
    fn test_line_breaks_rejected(
        before in "[a-z ]{0,10}",
        breaker in prop::sample::select(vec!["\n", "\r", "\0"]),
        after in "[a-z ]{0,10}",
    ) {
        let arg = format!("{}{}{}", before, breaker, after);
        let rendered = ShellCommand::new("echo").arg(arg).render();
        prop_assert!(rendered.is_err());
    }

    #[test]
    fn test_safe_words_stay_unquoted(word in "[A-Za-z0-9_./:@%+=,-]{1,30}") {
        prop_assert_eq!(quote(&word), word);
    }
}

mod composite_tests {
    use super::*;

    proptest! {
        #[test]
        fn test_chroot_keeps_pipelines_inside(
            root in "/mnt/[a-z]{1,10}",
            pattern in "[a-z]{1,10}",
        ) {
            let cmd = ShellCommand::new("cat")
                .arg("/proc/cpuinfo")
                .pipe(ShellCommand::new("grep").arg(pattern.clone()));
            let line = cmd.within_chroot(&root).unwrap().render().unwrap();
            let words = split_words(&line);

            prop_assert_eq!(words.len(), 5);
            prop_assert_eq!(&words[0], "chroot");
            prop_assert_eq!(&words[1], &root);
            prop_assert_eq!(&words[2], "sh");
            prop_assert_eq!(words[3].as_str(), "-c");
            prop_assert_eq!(&words[4], &cmd.render().unwrap());
            prop_assert!(words[4].ends_with(&pattern));
        }
    }
}
