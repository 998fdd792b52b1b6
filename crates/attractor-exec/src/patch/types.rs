#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchOperation {
    AddFile {
        path: String,
        lines: Vec<String>,
    },
    DeleteFile {
        path: String,
    },
    UpdateFile {
        path: String,
        move_to: Option<String>,
        hunks: Vec<PatchHunk>,
    },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            Self::AddFile { path, .. } => path,
            Self::DeleteFile { path } => path,
            Self::UpdateFile { path, .. } => path,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchHunk {
    pub header: String,
    pub lines: Vec<PatchHunkLine>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchHunkLine {
    Context(String),
    Delete(String),
    Add(String),
    EndOfFile,
}
