use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{ops, Embedding, Init, Linear, VarBuilder, VarMap};

use crate::{
    boundary::{PretrainingInputs, PretrainingModel, PretrainingOutput},
    config::BertConfig,
    errors::{ForwardError, ModelError},
    hooks::{ForwardHook, HookFilter},
    norm::LayerNorm,
};

const MASKED_ATTENTION_BIAS: f64 = -10_000.0;

/// BERT encoder with the masked-LM and next-sentence heads.
///
/// Parameters follow the familiar `bert.*` / `cls.*` naming so checkpoints and
/// weight-decay exclusion rules read the same as elsewhere. The MLM decoder is
/// tied to the word embedding matrix.
pub struct BertForPreTraining {
    config: BertConfig,
    parameters: Vec<(String, candle_core::Var)>,
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    pooler: Linear,
    transform: Linear,
    transform_norm: LayerNorm,
    decoder_bias: Tensor,
    seq_relationship: Linear,
    hooks: HookFilter,
}

impl BertForPreTraining {
    pub fn new(config: BertConfig, device: &Device) -> Result<Self, ModelError> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let init = Init::Randn {
            mean: 0.0,
            stdev: config.initializer_range,
        };

        let bert = vb.pp("bert");
        let embeddings = BertEmbeddings::new(&config, init, bert.pp("embeddings"))?;
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for index in 0..config.num_hidden_layers {
            layers.push(BertLayer::new(
                &config,
                init,
                bert.pp("encoder").pp("layer").pp(index.to_string()),
            )?);
        }
        let pooler = linear(
            config.hidden_size,
            config.hidden_size,
            init,
            bert.pp("pooler").pp("dense"),
        )?;

        let cls = vb.pp("cls");
        let predictions = cls.pp("predictions");
        let transform = linear(
            config.hidden_size,
            config.hidden_size,
            init,
            predictions.pp("transform").pp("dense"),
        )?;
        let transform_norm = LayerNorm::new(
            config.hidden_size,
            config.layer_norm_eps,
            predictions.pp("transform").pp("LayerNorm"),
        )?;
        let decoder_bias =
            predictions.get_with_hints(config.vocab_size, "bias", Init::Const(0.0))?;
        let seq_relationship = linear(
            config.hidden_size,
            2,
            init,
            cls.pp("seq_relationship"),
        )?;

        let mut parameters: Vec<_> = varmap
            .data()
            .lock()
            .map_err(|_| ModelError::Config("parameter map lock poisoned".into()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        parameters.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(Self {
            config,
            parameters,
            embeddings,
            layers,
            pooler,
            transform,
            transform_norm,
            decoder_bias,
            seq_relationship,
            hooks: HookFilter::none(),
        })
    }

    /// Installs the filter that decides which sub-modules call the forward hook.
    pub fn with_hooks(mut self, hooks: HookFilter) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    fn pooled(
        &self,
        sequence: &Tensor,
        next_sentence_positions: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        let first_tokens = match next_sentence_positions {
            Some(positions) => {
                let (batch, count) = positions.dims2()?;
                let hidden = sequence.dim(D::Minus1)?;
                let index = positions
                    .to_dtype(DType::U32)?
                    .unsqueeze(2)?
                    .broadcast_as((batch, count, hidden))?
                    .contiguous()?;
                sequence.gather(&index, 1)?
            }
            None => sequence.narrow(1, 0, 1)?.squeeze(1)?,
        };
        self.pooler.forward(&first_tokens)?.tanh()
    }

    fn prediction_scores(&self, sequence: &Tensor) -> candle_core::Result<Tensor> {
        let transformed = self.transform.forward(sequence)?.gelu()?;
        let transformed = self.transform_norm.forward(&transformed)?;
        let decoder = self.embeddings.word_embeddings.embeddings().t()?;
        transformed
            .broadcast_matmul(&decoder)?
            .broadcast_add(&self.decoder_bias)
    }
}

impl PretrainingModel for BertForPreTraining {
    fn named_parameters(&self) -> Vec<(String, candle_core::Var)> {
        self.parameters.clone()
    }

    fn hook_points(&self) -> Vec<String> {
        let mut points = vec!["bert.embeddings".to_string()];
        points.extend((0..self.layers.len()).map(|index| format!("bert.encoder.layer.{index}")));
        points.push("bert.pooler".to_string());
        points
    }

    fn forward(
        &self,
        inputs: &PretrainingInputs,
        hook: &dyn ForwardHook,
    ) -> Result<PretrainingOutput, ForwardError> {
        let mut hidden = self.embeddings.forward(
            &inputs.input_ids,
            &inputs.token_type_ids,
            inputs.positions.as_ref(),
        )?;
        self.hooks.fire("bert.embeddings", hook)?;

        let mask = attention_bias(&inputs.attention_mask, inputs.is_packed())?;
        for (index, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &mask)?;
            self.hooks
                .fire(&format!("bert.encoder.layer.{index}"), hook)?;
        }

        let pooled = self.pooled(&hidden, inputs.next_sentence_positions.as_ref())?;
        self.hooks.fire("bert.pooler", hook)?;

        let prediction_scores = self.prediction_scores(&hidden)?;
        let seq_relationship_score = self.seq_relationship.forward(&pooled)?;
        Ok(PretrainingOutput {
            prediction_scores,
            seq_relationship_score,
        })
    }
}

/// Additive attention bias shaped `[batch, 1, q, k]`.
///
/// Unpacked masks are 1 for real tokens and 0 for padding. Packed masks carry
/// the sequence number of every token (0 for padding) and only tokens of the
/// same sequence attend to each other.
fn attention_bias(attention_mask: &Tensor, packed: bool) -> candle_core::Result<Tensor> {
    let mask = attention_mask.to_dtype(DType::F32)?;
    let allowed = if packed {
        let rows = mask.unsqueeze(2)?;
        let cols = mask.unsqueeze(1)?;
        let same = rows.broadcast_eq(&cols)?.to_dtype(DType::F32)?;
        let valid = cols.ne(0f32)?.to_dtype(DType::F32)?;
        same.broadcast_mul(&valid)?.unsqueeze(1)?
    } else {
        mask.unsqueeze(1)?.unsqueeze(1)?
    };
    allowed.affine(-MASKED_ATTENTION_BIAS, MASKED_ATTENTION_BIAS)
}

fn linear(
    in_dim: usize,
    out_dim: usize,
    init: Init,
    vb: VarBuilder,
) -> candle_core::Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    norm: LayerNorm,
}

impl BertEmbeddings {
    fn new(config: &BertConfig, init: Init, vb: VarBuilder) -> candle_core::Result<Self> {
        let table = |rows: usize, name: &str| -> candle_core::Result<Embedding> {
            let weight = vb
                .pp(name)
                .get_with_hints((rows, config.hidden_size), "weight", init)?;
            Ok(Embedding::new(weight, config.hidden_size))
        };
        Ok(Self {
            word_embeddings: table(config.vocab_size, "word_embeddings")?,
            position_embeddings: table(config.max_position_embeddings, "position_embeddings")?,
            token_type_embeddings: table(config.type_vocab_size, "token_type_embeddings")?,
            norm: LayerNorm::new(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        positions: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        let (batch, seq) = input_ids.dims2()?;
        let positions = match positions {
            Some(positions) => positions.clone(),
            None => Tensor::arange(0u32, seq as u32, input_ids.device())?
                .unsqueeze(0)?
                .broadcast_as((batch, seq))?
                .contiguous()?,
        };
        let summed = (self.word_embeddings.forward(input_ids)?
            + self.position_embeddings.forward(&positions)?)?;
        let summed = (summed + self.token_type_embeddings.forward(token_type_ids)?)?;
        self.norm.forward(&summed)
    }
}

struct BertLayer {
    query: Linear,
    key: Linear,
    value: Linear,
    attention_output: Linear,
    attention_norm: LayerNorm,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl BertLayer {
    fn new(config: &BertConfig, init: Init, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        let attention = vb.pp("attention");
        let projection = attention.pp("self");
        Ok(Self {
            query: linear(hidden, hidden, init, projection.pp("query"))?,
            key: linear(hidden, hidden, init, projection.pp("key"))?,
            value: linear(hidden, hidden, init, projection.pp("value"))?,
            attention_output: linear(hidden, hidden, init, attention.pp("output").pp("dense"))?,
            attention_norm: LayerNorm::new(
                hidden,
                config.layer_norm_eps,
                attention.pp("output").pp("LayerNorm"),
            )?,
            intermediate: linear(
                hidden,
                config.intermediate_size,
                init,
                vb.pp("intermediate").pp("dense"),
            )?,
            output: linear(config.intermediate_size, hidden, init, vb.pp("output").pp("dense"))?,
            output_norm: LayerNorm::new(
                hidden,
                config.layer_norm_eps,
                vb.pp("output").pp("LayerNorm"),
            )?,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    fn split_heads(&self, tensor: Tensor, batch: usize, seq: usize) -> candle_core::Result<Tensor> {
        tensor
            .reshape((batch, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, hidden: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, seq, width) = hidden.dims3()?;
        let query = self.split_heads(self.query.forward(hidden)?, batch, seq)?;
        let key = self.split_heads(self.key.forward(hidden)?, batch, seq)?;
        let value = self.split_heads(self.value.forward(hidden)?, batch, seq)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (query.matmul(&key.t()?)? * scale)?.broadcast_add(mask)?;
        let probs = ops::softmax(&scores, D::Minus1)?;
        let context = probs
            .matmul(&value)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, width))?;

        let attended = (self.attention_output.forward(&context)? + hidden)?;
        let attended = self.attention_norm.forward(&attended)?;

        let expanded = self.intermediate.forward(&attended)?.gelu()?;
        let out = (self.output.forward(&expanded)? + &attended)?;
        self.output_norm.forward(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Interrupted, NoHook};
    use std::cell::RefCell;

    fn tiny_config() -> BertConfig {
        BertConfig {
            vocab_size: 32,
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 32,
            max_position_embeddings: 16,
            type_vocab_size: 2,
            initializer_range: 0.02,
            layer_norm_eps: 1e-12,
        }
    }

    fn inputs(device: &Device) -> PretrainingInputs {
        let ids = Tensor::new(&[[2i64, 5, 7, 0], [3, 4, 0, 0]], device).unwrap();
        let types = Tensor::zeros((2, 4), DType::I64, device).unwrap();
        let mask = Tensor::new(&[[1i64, 1, 1, 0], [1, 1, 0, 0]], device).unwrap();
        PretrainingInputs {
            input_ids: ids,
            token_type_ids: types,
            attention_mask: mask,
            positions: None,
            next_sentence_positions: None,
        }
    }

    struct StopAt {
        label: &'static str,
        seen: RefCell<Vec<String>>,
    }

    impl ForwardHook for StopAt {
        fn on_forward(&self, label: &str) -> Result<(), Interrupted> {
            self.seen.borrow_mut().push(label.to_string());
            if label == self.label {
                Err(Interrupted {
                    label: label.to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn forward_shapes() {
        let device = Device::Cpu;
        let model = BertForPreTraining::new(tiny_config(), &device).unwrap();
        let out = model.forward(&inputs(&device), &NoHook).unwrap();
        assert_eq!(out.prediction_scores.dims(), &[2, 4, 32]);
        assert_eq!(out.seq_relationship_score.dims(), &[2, 2]);
    }

    #[test]
    fn parameters_are_sorted_and_tied() {
        let model = BertForPreTraining::new(tiny_config(), &Device::Cpu).unwrap();
        let names: Vec<_> = model
            .named_parameters()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"bert.embeddings.word_embeddings.weight".to_string()));
        assert!(names.contains(&"cls.predictions.bias".to_string()));
        assert!(!names.iter().any(|name| name.contains("decoder.weight")));
    }

    #[test]
    fn hooks_fire_in_order_and_interrupt() {
        let device = Device::Cpu;
        let model = BertForPreTraining::new(tiny_config(), &device)
            .unwrap()
            .with_hooks(HookFilter::default());
        let hook = StopAt {
            label: "bert.encoder.layer.1_fwd",
            seen: RefCell::new(Vec::new()),
        };
        let err = model.forward(&inputs(&device), &hook).unwrap_err();
        assert!(err.is_interrupted());
        assert_eq!(
            hook.seen.into_inner(),
            vec![
                "bert.embeddings_fwd",
                "bert.encoder.layer.0_fwd",
                "bert.encoder.layer.1_fwd"
            ]
        );
    }

    #[test]
    fn packed_inputs_gather_sentence_positions() {
        let device = Device::Cpu;
        let model = BertForPreTraining::new(tiny_config(), &device).unwrap();
        let mut packed = inputs(&device);
        packed.attention_mask = Tensor::new(&[[1i64, 1, 2, 0], [1, 1, 0, 0]], &device).unwrap();
        packed.positions = Some(Tensor::new(&[[0i64, 1, 0, 0], [0, 1, 0, 0]], &device).unwrap());
        packed.next_sentence_positions =
            Some(Tensor::new(&[[0i64, 2], [0, 0]], &device).unwrap());
        let out = model.forward(&packed, &NoHook).unwrap();
        assert_eq!(out.seq_relationship_score.dims(), &[2, 2, 2]);
    }
}
