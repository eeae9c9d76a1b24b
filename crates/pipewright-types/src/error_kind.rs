//! The closed set of errors the HTTP layer can report.
//!
//! Each kind carries a stable numeric code, a short English message, a
//! longer user-facing description and the HTTP status it maps to.

use serde::{Deserialize, Serialize};

macro_rules! error_kinds {
    (
        $( $variant:ident = $code:literal, $status:literal, $message:literal, $description:literal; )+
    ) => {
        /// Stable error identifiers.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum ErrorKind {
            $( $variant ),+
        }

        impl ErrorKind {
            pub const ALL: &'static [ErrorKind] = &[$(ErrorKind::$variant),+];

            pub fn code(&self) -> u32 {
                match self {
                    $( ErrorKind::$variant => $code ),+
                }
            }

            pub fn status(&self) -> u16 {
                match self {
                    $( ErrorKind::$variant => $status ),+
                }
            }

            pub fn message(&self) -> &'static str {
                match self {
                    $( ErrorKind::$variant => $message ),+
                }
            }

            pub fn description(&self) -> &'static str {
                match self {
                    $( ErrorKind::$variant => $description ),+
                }
            }
        }
    };
}

error_kinds! {
    Unknown = 0, 500, "unknown error", "Something went wrong, try again later";
    BodyParse = 1, 400, "can't parse request body", "The request body is malformed";
    Validation = 2, 400, "validation error", "The request did not pass validation";
    MissingIdentity = 3, 401, "no user login", "The request carries no user identity";
    Forbidden = 4, 403, "no access rights", "You have no access to this resource";
    TaskNotFound = 10, 404, "can't find task", "The work with this number does not exist";
    VersionNotFound = 11, 404, "can't find version", "The pipeline version does not exist";
    PipelineNotFound = 12, 404, "can't find pipeline", "The pipeline does not exist";
    StepNotFound = 13, 404, "can't find step", "The step does not exist";
    BlockNotFound = 14, 400, "can't find block", "The block does not exist in this pipeline";
    PipelineNameUsed = 15, 400, "pipeline name is already used", "A pipeline with this name already exists";
    VersionNotApproved = 16, 400, "version is not approved", "Only approved versions can be run";
    VersionNotDraft = 17, 400, "version is not a draft", "Only draft versions can be edited";
    UpdateNotRunningTask = 20, 400, "can't update not running work", "The work is not running";
    UpdateBlock = 21, 400, "can't update block", "The block could not be updated";
    UserNotPartOfProcess = 22, 403, "user is not part of the process", "You are not a participant of this step";
    DecisionAlreadySet = 23, 400, "decision already set", "A decision has already been made";
    NotTakenInWork = 24, 400, "not taken in work", "The step must be taken in work first";
    UnknownAction = 25, 400, "unknown action", "The action is not supported";
    NoUnfinishedSteps = 26, 400, "no unfinished steps", "There is nothing to update in this work";
    StopTask = 27, 400, "can't stop work", "The work could not be stopped";
    RateTask = 28, 400, "can't rate work", "Only finished works can be rated";
    PauseTask = 30, 400, "can't pause work", "The work could not be paused";
    TaskIsPaused = 31, 400, "work is paused", "The work is paused";
    UnpauseTask = 32, 400, "can't start work", "The work is not paused";
    MonitoringEditBlockParse = 33, 400, "can't parse block edit", "The edited data does not match the block";
    GetBlockContext = 34, 400, "can't get block context", "The block context could not be built";
    HiddenBlock = 35, 403, "block is hidden", "This block is hidden from monitoring";
    TypeMismatch = 36, 400, "value type mismatch", "The value does not match the declared type";
    Mapping = 40, 400, "mapping error", "A variable mapping could not be resolved";
    ParallelNodeReturnCycle = 41, 400, "parallel node return cycle", "A branch loops back out of its parallel section";
    ParallelNodeExitsNotConnected = 42, 400, "parallel node exits not connected", "Not every parallel branch reaches the join";
    OutOfParallelNodesConnection = 43, 400, "connection out of parallel nodes", "A branch leaves its parallel section";
    ParallelPathIntersected = 44, 400, "parallel paths intersected", "Parallel sections overlap";
    UnknownBlockKind = 45, 400, "unknown block type", "The block type is not supported";
    InvalidBlockParams = 46, 400, "invalid block parameters", "The block parameters are invalid";
    GraphInvalid = 47, 400, "invalid pipeline graph", "The pipeline graph is invalid";
    Storage = 50, 500, "storage error", "The storage is unavailable";
    Bus = 51, 500, "message bus error", "The message bus is unavailable";
    ExternalService = 52, 502, "external service error", "A dependent service failed";
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}
