use anyhow::Context;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};

/// `CommandBuilder` is used to prepare a command to be spawned into a pty.
/// The interface is intentionally similar to that of `std::process::Command`.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandBuilder {
    args: Vec<OsString>,
    envs: BTreeMap<OsString, OsString>,
    cwd: Option<OsString>,
}

impl CommandBuilder {
    /// Create a new builder instance with argv[0] set to the specified
    /// program.
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            args: vec![program.as_ref().to_owned()],
            envs: std::env::vars_os().collect(),
            cwd: None,
        }
    }

    /// Create a new builder instance from a pre-built argument vector
    pub fn from_argv(args: Vec<OsString>) -> Self {
        Self {
            args,
            envs: std::env::vars_os().collect(),
            cwd: None,
        }
    }

    /// Create a new builder instance that will run some idea of a default
    /// program.  Such a builder will panic if `arg` is called on it.
    pub fn new_default_prog() -> Self {
        Self {
            args: vec![],
            envs: std::env::vars_os().collect(),
            cwd: None,
        }
    }

    /// Returns true if this builder was created via `new_default_prog`
    pub fn is_default_prog(&self) -> bool {
        self.args.is_empty()
    }

    /// Append an argument to the current command line.
    /// Will panic if called on a builder created via `new_default_prog`.
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) {
        if self.is_default_prog() {
            panic!("attempted to add args to a default_prog builder");
        }
        self.args.push(arg.as_ref().to_owned());
    }

    /// Append a sequence of arguments to the current command line
    pub fn args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg);
        }
    }

    pub fn get_argv(&self) -> &Vec<OsString> {
        &self.args
    }

    /// Override the value of an environmental variable
    pub fn env<K, V>(&mut self, key: K, value: V)
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.envs
            .insert(key.as_ref().to_owned(), value.as_ref().to_owned());
    }

    pub fn env_remove<K>(&mut self, key: K)
    where
        K: AsRef<OsStr>,
    {
        self.envs.remove(key.as_ref());
    }

    fn get_env<K>(&self, key: K) -> Option<&OsStr>
    where
        K: AsRef<OsStr>,
    {
        self.envs.get(key.as_ref()).map(OsString::as_os_str)
    }

    pub fn cwd<D>(&mut self, dir: D)
    where
        D: AsRef<OsStr>,
    {
        self.cwd = Some(dir.as_ref().to_owned());
    }

    pub fn get_cwd(&self) -> Option<&OsString> {
        self.cwd.as_ref()
    }

    /// Return the configured command and arguments as a single string,
    /// quoted per the unix shell conventions.
    pub fn as_unix_command_line(&self) -> anyhow::Result<String> {
        let mut strs = vec![];
        for arg in &self.args {
            let s = arg
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("argument cannot be represented as utf8"))?;
            strs.push(s);
        }
        Ok(shell_words::join(strs))
    }
}

#[cfg(unix)]
impl CommandBuilder {
    fn search_path(&self, exe: &OsStr, cwd: &OsStr) -> anyhow::Result<OsString> {
        use std::path::Path;
        let exe_path: &Path = exe.as_ref();
        if exe_path.is_relative() && exe_path.components().count() > 1 {
            let cwd: &Path = cwd.as_ref();
            let abs_path = cwd.join(exe_path);
            if abs_path.exists() {
                return Ok(abs_path.into_os_string());
            }
        }

        if exe_path.is_relative() {
            if let Some(path) = self.get_env("PATH") {
                for path in std::env::split_paths(&path) {
                    let candidate = path.join(exe);
                    if candidate.exists() {
                        return Ok(candidate.into_os_string());
                    }
                }
            }
            anyhow::bail!(
                "Unable to spawn {} because it doesn't exist on the filesystem \
                and was not found in PATH",
                exe_path.display()
            );
        }

        if !exe_path.exists() {
            anyhow::bail!(
                "Unable to spawn {} because it doesn't exist on the filesystem",
                exe_path.display()
            );
        }

        Ok(exe.to_owned())
    }

    /// Convert the CommandBuilder to a `std::process::Command` instance.
    pub(crate) fn as_command(&self) -> anyhow::Result<std::process::Command> {
        use std::os::unix::process::CommandExt;

        let home = self.get_home_dir()?;
        let dir: &OsStr = self
            .cwd
            .as_ref()
            .map(|dir| dir.as_os_str())
            .filter(|dir| std::path::Path::new(dir).is_dir())
            .unwrap_or(home.as_ref());

        let mut cmd = if self.is_default_prog() {
            let shell = self.get_shell()?;

            let mut cmd = std::process::Command::new(&shell);

            // Run the shell as a login shell by prefixing the shell's
            // basename with `-` and setting that as argv0
            let basename = shell.rsplit('/').next().unwrap_or(&shell);
            cmd.arg0(format!("-{}", basename));
            cmd
        } else {
            let resolved = self.search_path(&self.args[0], dir)?;
            let mut cmd = std::process::Command::new(resolved);
            cmd.arg0(&self.args[0]);
            cmd.args(&self.args[1..]);
            cmd
        };

        cmd.current_dir(dir);

        cmd.env_clear();
        cmd.envs(self.envs.iter());

        Ok(cmd)
    }

    /// Determine which shell to run.
    /// We take the contents of the $SHELL env var first, then
    /// fall back to looking it up from the password database.
    pub fn get_shell(&self) -> anyhow::Result<String> {
        if let Some(shell) = self.get_env("SHELL").and_then(OsStr::to_str) {
            return Ok(shell.into());
        }

        let ent = unsafe { libc::getpwuid(libc::getuid()) };
        if ent.is_null() {
            Ok("/bin/sh".into())
        } else {
            use std::ffi::CStr;
            let shell = unsafe { CStr::from_ptr((*ent).pw_shell) };
            shell
                .to_str()
                .map(str::to_owned)
                .context("failed to resolve shell")
        }
    }

    fn get_home_dir(&self) -> anyhow::Result<String> {
        if let Some(home_dir) = self.get_env("HOME").and_then(OsStr::to_str) {
            return Ok(home_dir.into());
        }

        let ent = unsafe { libc::getpwuid(libc::getuid()) };
        if ent.is_null() {
            Ok("/".into())
        } else {
            use std::ffi::CStr;
            let home = unsafe { CStr::from_ptr((*ent).pw_dir) };
            home.to_str()
                .map(str::to_owned)
                .context("failed to resolve home dir")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env() {
        let mut cmd = CommandBuilder::new("dummy");
        cmd.env("UPTERM_TEST_KEY", "value");
        assert_eq!(cmd.get_env("UPTERM_TEST_KEY"), Some(OsStr::new("value")));

        cmd.env_remove("UPTERM_TEST_KEY");
        assert!(cmd.get_env("UPTERM_TEST_KEY").is_none());
    }

    #[test]
    fn test_command_line() {
        let mut cmd = CommandBuilder::new("echo");
        cmd.args(["hello world", "plain"]);
        k9::assert_equal!(
            cmd.as_unix_command_line().unwrap(),
            "echo 'hello world' plain"
        );
    }

    #[test]
    #[should_panic]
    fn default_prog_rejects_args() {
        let mut cmd = CommandBuilder::new_default_prog();
        cmd.arg("nope");
    }
}
