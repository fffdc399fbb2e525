use super::*;

#[derive(Resource)]
pub(super) struct ApiChannels {
    pub receiver: Receiver<ApiCommand>,
}

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) sender: Sender<ApiCommand>,
}
