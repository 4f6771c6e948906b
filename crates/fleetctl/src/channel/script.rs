/// Shell functions shared by every supervisor and status script.
///
/// `fleet_alive` treats zombies as dead. `fleet_owns` also requires the command line to contain
/// the service's match pattern, so a PID recycled by an unrelated process counts as stale.
/// `fleet_proc_table` lists `pid cmdline` for every
/// process except the script's own shell; scripts arrive on stdin, so no other process has the
/// script text in its command line.
const HELPERS: &str = r#"fleet_alive() {
  case "$1" in ''|*[!0-9]*) return 1 ;; esac
  [ -r "/proc/$1/stat" ] || return 1
  fleet_state=$(sed -n 's/^.*) \(.\) .*$/\1/p' "/proc/$1/stat" 2>/dev/null)
  [ -n "$fleet_state" ] && [ "$fleet_state" != Z ] && [ "$fleet_state" != X ]
}
fleet_owns() {
  fleet_alive "$1" || return 1
  fleet_owned_cmd=$(tr '\000' ' ' 2>/dev/null < "/proc/$1/cmdline")
  case "$fleet_owned_cmd" in
    *"$2"*) return 0 ;;
  esac
  return 1
}
fleet_read_pid() {
  head -n 1 "$1" 2>/dev/null | tr -cd '0-9'
}
fleet_proc_table() {
  for fleet_dir in /proc/[0-9]*; do
    fleet_p=${fleet_dir#/proc/}
    [ "$fleet_p" = "$$" ] && continue
    fleet_cmd=$(tr '\000' ' ' 2>/dev/null < "$fleet_dir/cmdline")
    [ -n "$fleet_cmd" ] && printf '%s %s\n' "$fleet_p" "$fleet_cmd"
  done
  return 0
}
fleet_refresh() {
  fleet_table=$(fleet_proc_table)
}
fleet_match() {
  [ -n "$1" ] || return 0
  printf '%s\n' "$fleet_table" | while read -r fleet_p fleet_cmd; do
    case "$fleet_cmd" in
      *"$1"*) fleet_alive "$fleet_p" && printf '%s\n' "$fleet_p" ;;
    esac
  done
  return 0
}
fleet_wait_gone() {
  fleet_ticks=$1
  shift
  while [ "$fleet_ticks" -gt 0 ]; do
    fleet_any=
    for fleet_w in "$@"; do
      fleet_alive "$fleet_w" && fleet_any=1
    done
    [ -z "$fleet_any" ] && return 0
    fleet_ticks=$((fleet_ticks - 1))
    sleep 0.2
  done
  return 1
}
fleet_emit() {
  printf '%s\t%s\t%s\n' "$1" "$2" "$3"
}
"#;

/// A POSIX `sh` script assembled from fixed templates and quoted values.
///
/// Dynamic values only enter through [`RemoteScript::set`], [`RemoteScript::set_args`] and
/// [`RemoteScript::command`], which single-quote them; [`RemoteScript::line`] is for static text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RemoteScript {
    text: String,
}

impl RemoteScript {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_helpers() -> Self {
        Self {
            text: HELPERS.to_string(),
        }
    }

    pub(crate) fn line(mut self, line: &str) -> Self {
        self.text.push_str(line);
        if !line.ends_with('\n') {
            self.text.push('\n');
        }
        self
    }

    pub(crate) fn set(self, name: &str, value: &str) -> Self {
        debug_assert!(is_shell_name(name), "invalid shell variable {name}");
        let line = format!("{name}={}", shell_escape(value));
        self.line(&line)
    }

    /// Replaces the positional parameters, so templates can use `"$@"`.
    pub(crate) fn set_args<S: AsRef<str>>(self, args: &[S]) -> Self {
        let mut line = String::from("set --");
        for arg in args {
            line.push(' ');
            line.push_str(&shell_escape(arg.as_ref()));
        }
        self.line(&line)
    }

    pub(crate) fn command<S: AsRef<str>>(self, argv: &[S]) -> Self {
        let line = argv
            .iter()
            .map(|arg| shell_escape(arg.as_ref()))
            .collect::<Vec<_>>()
            .join(" ");
        self.line(&line)
    }

    pub(crate) fn text(&self) -> &str {
        &self.text
    }
}

pub(crate) fn shell_escape(value: &str) -> String {
    let mut escaped = String::from("'");
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

fn is_shell_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
