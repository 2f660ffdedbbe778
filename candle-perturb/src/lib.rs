pub mod candle_adversary;
pub mod candle_aux_layers;
pub mod candle_covariate_embedding;
pub mod candle_data_loader;
pub mod candle_likelihood_decoder;
pub mod candle_loss_functions;
pub mod candle_metrics;
pub mod candle_model_traits;
pub mod candle_perturb_module;
pub mod candle_perturbation_encoder;
pub mod candle_state_encoder;
pub mod candle_train_plan;

pub use candle_core;
pub use candle_nn;
