use crate::errors::{Error, Result};
use crate::github::RunnerApplicationDownload;
use crate::params::BootstrapArgs;
use serde::Serialize;

/// Cloud-init user data: one rendered setup script plus the command that
/// runs it on first boot.
#[derive(Debug, Serialize)]
pub struct Data {
    pub write_files: Vec<WriteFile>,
    pub runcmd: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    pub permissions: String,
}

impl Data {
    pub fn from_bootstrap(args: &BootstrapArgs) -> Result<Self> {
        let tool = select_tool(args)?;
        let template = include_str!("../scripts/setup-runner.sh");
        let content = template
            .replace("___RUNNER_NAME___", &args.name)
            .replace("___DOWNLOAD_URL___", &tool.download_url)
            .replace("___FILENAME___", &tool.filename)
            .replace("___SCOPE_URL___", &args.scope_url)
            .replace("___REGISTRATION_TOKEN___", &args.registration_token)
            .replace("___LABELS___", &args.labels.join(","))
            .replace("___CALLBACK_URL___", &args.callback_url)
            .replace("___INSTANCE_TOKEN___", &args.instance_token);

        Ok(Self {
            write_files: vec![WriteFile {
                path: "/opt/setup-runner.sh".into(),
                permissions: "0755".into(),
                content,
            }],
            runcmd: vec!["/opt/setup-runner.sh".into()],
        })
    }

    pub fn to_user_data(&self) -> serde_yaml::Result<String> {
        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(self)?))
    }
}

fn select_tool(args: &BootstrapArgs) -> Result<&RunnerApplicationDownload> {
    let os = args.os_type.tools_os();
    let arch = args.os_arch.tools_arch();
    args.tools
        .iter()
        .find(|tool| tool.os == os && tool.architecture == arch)
        .ok_or_else(|| Error::not_found(format!("no runner tool for {os}/{arch}")))
}
